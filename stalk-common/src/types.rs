//! # Tube Name Type
//!
//! Validated tube names shared by the driver and its callers.
//!
//! ## Design Principles
//!
//! 1. **Validate Once**: A `TubeName` can only be built through `TubeName::new`,
//!    so every name that reaches the wire has already been checked. Bad names
//!    fail on the caller's side before a single byte is written.
//!
//! 2. **Server Limits**: Names are capped at `MAX_TUBE_NAME_LEN` bytes and may
//!    not contain whitespace or control characters, which would break the
//!    space-separated command line.
//!
//! 3. **Ordered**: Names are `Ord` so watched sets can live in a `BTreeSet`
//!    and diff deterministically.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::{NameError, NameResult};

/// Maximum tube name size in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// Tube every fresh connection uses and watches.
pub const DEFAULT_TUBE: &str = "default";

/// Name of a tube on the server.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TubeName(String);

impl TubeName {
    /// Creates a tube name after checking it against the server's rules.
    ///
    /// # Errors
    /// Returns `NameError::Empty`, `NameError::TooLong` or `NameError::BadChar`.
    ///
    /// # Examples
    /// ```rust
    /// use stalk_common::{NameError, TubeName};
    ///
    /// let tube = TubeName::new("emails").expect("valid name");
    /// assert_eq!(tube.as_str(), "emails");
    ///
    /// assert_eq!(TubeName::new("two words"), Err(NameError::BadChar { ch: ' ' }));
    /// ```
    pub fn new(name: impl Into<String>) -> NameResult<Self> {
        let name = name.into();
        validate(&name)?;
        Ok(TubeName(name))
    }

    /// Returns the `"default"` tube.
    pub fn default_tube() -> Self {
        TubeName(DEFAULT_TUBE.to_string())
    }

    /// Returns the name as a string slice
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the name length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; empty names are rejected at construction.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true for the `"default"` tube.
    #[inline]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_TUBE
    }
}

fn validate(name: &str) -> NameResult<()> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_TUBE_NAME_LEN {
        return Err(NameError::TooLong { len: name.len() });
    }
    if let Some(ch) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
        return Err(NameError::BadChar { ch });
    }
    Ok(())
}

impl Default for TubeName {
    fn default() -> Self {
        TubeName::default_tube()
    }
}

impl FromStr for TubeName {
    type Err = NameError;

    fn from_str(s: &str) -> NameResult<Self> {
        TubeName::new(s)
    }
}

impl TryFrom<&str> for TubeName {
    type Error = NameError;

    fn try_from(value: &str) -> NameResult<Self> {
        TubeName::new(value)
    }
}

impl TryFrom<String> for TubeName {
    type Error = NameError;

    fn try_from(value: String) -> NameResult<Self> {
        TubeName::new(value)
    }
}

impl AsRef<str> for TubeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TubeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TubeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TubeName({:?})", self.0)
    }
}

impl fmt::Display for TubeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
