//! Validated database configuration types
//!
//! ```rust
//! use tradevault_core::database::PoolSize;
//!
//! let pool = PoolSize::new(8).expect("8 is valid");
//! assert_eq!(pool.get(), 8);
//! assert!(PoolSize::new(0).is_none());
//! ```

use serde::{Deserialize, Serialize};

const MAX_CONNECTIONS: u8 = 100;

/// Number of pooled connections, 1 to 100.
///
/// The pool opens exactly this many connections at startup and never
/// resizes, so the bound doubles as a cap on open file handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct PoolSize(u8);

impl PoolSize {
    pub const fn new(size: u8) -> Option<Self> {
        match size {
            1..=MAX_CONNECTIONS => Some(Self(size)),
            _ => None,
        }
    }

    pub const fn get(self) -> usize {
        self.0 as usize
    }
}

// A single-file store serialises writers; extra connections serve readers.
impl Default for PoolSize {
    fn default() -> Self {
        Self(5)
    }
}

impl TryFrom<usize> for PoolSize {
    type Error = String;

    fn try_from(size: usize) -> Result<Self, Self::Error> {
        u8::try_from(size)
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| format!("pool size {size} is out of range (1-{MAX_CONNECTIONS})"))
    }
}

impl From<PoolSize> for usize {
    fn from(pool: PoolSize) -> Self {
        pool.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_bounds() {
        assert!(PoolSize::new(1).is_some());
        assert!(PoolSize::new(100).is_some());
        assert!(PoolSize::new(0).is_none());
        assert!(PoolSize::new(101).is_none());
        assert!(PoolSize::try_from(1000usize).is_err());
        assert!(PoolSize::try_from(256usize).is_err());
        assert_eq!(PoolSize::default().get(), 5);
    }

    #[test]
    fn test_pool_size_serde() {
        let size: PoolSize = serde_json::from_str("12").unwrap();
        assert_eq!(size.get(), 12);

        let err = serde_json::from_str::<PoolSize>("0").unwrap_err();
        assert!(err.to_string().contains("out of range"));

        assert_eq!(serde_json::to_string(&size).unwrap(), "12");
    }
}
