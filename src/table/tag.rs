//! Lookup of table records by category tag and name

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::{HandleError, HandleTable, Identity, Iter, TableProvider};

/// Four-character category code, such as `weap`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Tag(u32);

impl Tag {
    /// Builds a tag from its four characters
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(u32::from_be_bytes(*code))
    }

    /// Wraps a tag as the host stores it
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The tag as the host stores it
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// The four characters of the tag
    pub const fn bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

/// Error when parsing a [`Tag`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid tag {0:?}: expected up to four ASCII characters")]
pub struct InvalidTag(pub String);

impl FromStr for Tag {
    type Err = InvalidTag;

    /// Parses up to four ASCII characters, padding short codes with spaces
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 4 || !s.is_ascii() {
            return Err(InvalidTag(s.to_owned()));
        }
        let mut code = [b' '; 4];
        code[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self::new(&code))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.bytes() {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({self})")
    }
}

/// Records that carry a category tag and a name
pub trait Tagged {
    /// Category of the record
    fn category(&self) -> Tag;
    /// Name of the record within its category
    fn name(&self) -> &str;
}

/// Marker for a record category known at compile time
pub trait Category {
    /// Tag of the category
    const TAG: Tag;
}

impl<T: Tagged, P: TableProvider> HandleTable<T, P> {
    /// Finds the first occupied slot, in table order, whose category and name match exactly
    pub fn lookup_by_key(&self, category: Tag, name: &str) -> Result<Identity<T>, HandleError> {
        self.iter(|record: &T| record.category() == category && record.name() == name)?
            .map(|(identity, _)| identity)
            .next()
            .ok_or(HandleError::NotFound)
    }

    /// Finds a record of category `C` by name
    pub fn lookup<C: Category>(&self, name: &str) -> Result<Identity<T>, HandleError> {
        self.lookup_by_key(C::TAG, name)
    }

    /// Iterates occupied records of one category
    pub fn iter_category(
        &self,
        category: Tag,
    ) -> Result<Iter<'_, T, P, impl Fn(&T) -> bool + Clone>, HandleError> {
        self.iter(move |record: &T| record.category() == category)
    }
}
