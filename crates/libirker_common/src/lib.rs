//! Common types shared by the irker crates.

use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

/// An IRC channel name. Channel names are case insensitive (RFC 2812, section 2.2), so this type
/// defines `Eq` and `Hash` to compare the casemapped form. `display` shows the original spelling,
/// which is what goes out on the wire.
#[derive(Debug, Clone)]
pub struct ChanName(String);

/// Slice version of `ChanName`.
#[derive(Debug)]
pub struct ChanNameRef(str);

impl Deref for ChanName {
    type Target = ChanNameRef;

    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

impl AsRef<ChanNameRef> for ChanName {
    fn as_ref(&self) -> &ChanNameRef {
        ChanNameRef::new(self.0.as_ref())
    }
}

impl Borrow<ChanNameRef> for ChanName {
    fn borrow(&self) -> &ChanNameRef {
        self.as_ref()
    }
}

// RFC 2812 casemapping: ASCII characters map to their lowercase versions, and '[', ']', '\\', '~'
// map to '{', '}', '|', '^'. Everything else is left unchanged.
fn to_lower(c: char) -> char {
    match c {
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        '~' => '^',
        _ => c.to_ascii_lowercase(),
    }
}

impl ChanName {
    pub fn new(name: String) -> Self {
        ChanName(name)
    }

    pub fn display(&self) -> &str {
        &self.0
    }
}

impl ChanNameRef {
    pub fn new(name: &str) -> &Self {
        unsafe { &*(name as *const str as *const ChanNameRef) }
    }

    pub fn display(&self) -> &str {
        &self.0
    }

    /// The channel-type character (`#`, `&`, `+`, `!`). IRC daemons advertise per-type join
    /// limits, so limit accounting is partitioned by this character.
    pub fn prefix(&self) -> char {
        self.0.chars().next().unwrap_or('#')
    }

    pub fn normalized(&self) -> String {
        self.0.chars().map(to_lower).collect()
    }
}

impl ToOwned for ChanNameRef {
    type Owned = ChanName;

    fn to_owned(&self) -> Self::Owned {
        ChanName(self.0.to_owned())
    }
}

impl PartialEq for ChanName {
    fn eq(&self, other: &Self) -> bool {
        let self_borrowed: &ChanNameRef = self.borrow();
        let other_borrowed: &ChanNameRef = other.borrow();
        self_borrowed.eq(other_borrowed)
    }
}

impl Eq for ChanName {}

impl PartialEq<ChanNameRef> for ChanName {
    fn eq(&self, other: &ChanNameRef) -> bool {
        let self_borrowed: &ChanNameRef = self.borrow();
        self_borrowed.eq(other)
    }
}

impl Hash for ChanName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let self_borrowed: &ChanNameRef = self.borrow();
        self_borrowed.hash(state)
    }
}

impl PartialEq for ChanNameRef {
    fn eq(&self, other: &Self) -> bool {
        // The casemapping maps characters 1:1 within ASCII and leaves the rest alone, so equal
        // names always have equal byte lengths.
        if self.0.len() != other.0.len() {
            return false;
        }

        self.0
            .chars()
            .map(to_lower)
            .zip(other.0.chars().map(to_lower))
            .all(|(a, b)| a == b)
    }
}

impl Eq for ChanNameRef {}

impl PartialEq<ChanName> for ChanNameRef {
    fn eq(&self, other: &ChanName) -> bool {
        let other_borrowed: &ChanNameRef = other.borrow();
        self.eq(other_borrowed)
    }
}

impl Hash for ChanNameRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for c in self.0.chars() {
            to_lower(c).hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    #[test]
    fn casemapped_equality() {
        assert_eq!(
            ChanName::new("#Devel".to_owned()),
            ChanName::new("#devel".to_owned())
        );
        assert_eq!(
            ChanName::new("#foo[]".to_owned()),
            ChanName::new("#FOO{}".to_owned())
        );
        assert_ne!(
            ChanName::new("#foo".to_owned()),
            ChanName::new("#fooo".to_owned())
        );
        assert_eq!(
            ChanName::new("#X~y".to_owned()),
            *ChanNameRef::new("#x^Y")
        );
    }

    #[test]
    fn casemapped_lookup() {
        let mut map: HashMap<ChanName, u32> = HashMap::new();
        map.insert(ChanName::new("#Rizon".to_owned()), 1);
        assert_eq!(map.get(ChanNameRef::new("#rizon")), Some(&1));
        assert!(map.remove(ChanNameRef::new("#RIZON")).is_some());
        assert!(map.is_empty());
    }

    #[test]
    fn prefix_and_normalized() {
        assert_eq!(ChanNameRef::new("#devel").prefix(), '#');
        assert_eq!(ChanNameRef::new("&local").prefix(), '&');
        assert_eq!(ChanNameRef::new("+modeless").prefix(), '+');
        assert_eq!(ChanNameRef::new("#Ab[c]").normalized(), "#ab{c}");
        // Normalizing is idempotent.
        let once = ChanNameRef::new("#Ab[c]~").normalized();
        assert_eq!(ChanNameRef::new(&once).normalized(), once);
    }
}
