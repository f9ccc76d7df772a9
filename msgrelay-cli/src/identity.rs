//! Local identity file.
//!
//! Format (`me.info` by default):
//!
//! ```text
//! <name>
//! <client id, 32 hex digits>
//! ```
//!
//! Further lines are ignored.

use msgrelay_protocol::ClientId;
use std::path::Path;

/// Default identity file name.
pub const IDENTITY_FILE: &str = "me.info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub client_id: ClientId,
}

impl Identity {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let mut lines = content.lines().map(str::trim);

        let name = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| format!("{}: missing name line", path.display()))?
            .to_string();
        let client_id = lines
            .next()
            .ok_or_else(|| format!("{}: missing client id line", path.display()))?
            .parse::<ClientId>()
            .map_err(|e| format!("{}: bad client id: {}", path.display(), e))?;

        Ok(Self { name, client_id })
    }

    /// Writes the identity, refusing to replace an existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let path = path.as_ref();
        if path.exists() {
            return Err(format!("{} already exists", path.display()).into());
        }
        std::fs::write(path, format!("{}\n{}\n", self.name, self.client_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IDENTITY_FILE);
        let identity = Identity {
            name: "alice".to_string(),
            client_id: ClientId::generate(),
        };

        identity.save(&path).unwrap();
        assert_eq!(Identity::load(&path).unwrap(), identity);

        // Never clobber an existing identity
        assert!(identity.save(&path).is_err());
    }

    #[test]
    fn test_load_ignores_extra_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IDENTITY_FILE);
        std::fs::write(
            &path,
            "bob\n00112233445566778899aabbccddeeff\nprivate key material\n",
        )
        .unwrap();

        let identity = Identity::load(&path).unwrap();
        assert_eq!(identity.name, "bob");
        assert_eq!(identity.client_id.to_hex(), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_load_rejects_bad_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IDENTITY_FILE);

        std::fs::write(&path, "").unwrap();
        assert!(Identity::load(&path).is_err());

        std::fs::write(&path, "carol\nnot-hex\n").unwrap();
        assert!(Identity::load(&path).is_err());

        assert!(Identity::load(dir.path().join("missing")).is_err());
    }
}
