//! Persistent device token store
//!
//! The file format is one `<decimal device id>=<hex token>` per line.
//! Blank lines and lines starting with `#` are ignored.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::{DeviceId, Error, Result, Token};

/// Mapping from device id to shared token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenStore {
    tokens: HashMap<DeviceId, Token>,
}

impl TokenStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a store from `path`; a missing file yields an empty store
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut store = Self::new();
        store.load_file(path)?;
        Ok(store)
    }

    /// Merges the contents of `path` into this store
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Token file {} does not exist, starting empty", path.display());
                return Ok(());
            }
            Err(e) => {
                return Err(Error::config(format!(
                    "Unable to read token file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let parsed = Self::parse(&contents)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        self.tokens.extend(parsed.tokens);
        Ok(())
    }

    /// Parses the token file format
    pub fn parse(contents: &str) -> Result<Self> {
        let mut tokens = HashMap::new();

        for (number, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed = || Error::config(format!("Malformed line {}: {}", number + 1, line));

            let mut parts = line.split('=');
            let (id, token) = match (parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(token), None) => (id, token),
                _ => return Err(malformed()),
            };
            if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }

            let id: u32 = id.parse().map_err(|_| malformed())?;
            let token: Token = token.parse().map_err(|_| malformed())?;
            tokens.insert(DeviceId(id), token);
        }

        Ok(TokenStore { tokens })
    }

    /// Renders the store in file format, ordered by device id
    pub fn render(&self) -> String {
        let mut ids: Vec<_> = self.tokens.keys().copied().collect();
        ids.sort();

        let mut out = String::new();
        for id in ids {
            let _ = writeln!(out, "{}={}", id, self.tokens[&id]);
        }
        out
    }

    /// Writes the store to `path`, replacing its contents.
    ///
    /// The contents go to a sibling temporary file first and are renamed
    /// into place, so readers never see a partial file.
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let written = fs::write(&tmp, self.render()).and_then(|()| fs::rename(&tmp, path));
        written.map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::config(format!("Unable to write token file {}: {}", path.display(), e))
        })
    }

    /// Token for `id`, if known
    pub fn get(&self, id: DeviceId) -> Option<Token> {
        self.tokens.get(&id).copied()
    }

    /// Stores the token of `id`, returning the previous one
    pub fn insert(&mut self, id: DeviceId, token: Token) -> Option<Token> {
        self.tokens.insert(id, token)
    }

    /// Forgets the token of `id`
    pub fn remove(&mut self, id: DeviceId) -> Option<Token> {
        self.tokens.remove(&id)
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.tokens.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
