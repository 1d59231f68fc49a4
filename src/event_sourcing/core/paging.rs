use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use super::event::RawEvent;

// ============================================================================
// Pagination State - Opaque Cursor Shared by Every Paged Read
// ============================================================================
//
// A cursor is (continuation token, has_more). Once has_more is false the
// cursor is terminal: reading with it yields an empty page and never reaches
// storage. Tokens come from the backend and are not portable across schema
// or table changes.
//
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingState {
    token: Option<Vec<u8>>,
    has_more: bool,
}

impl PagingState {
    /// Cursor positioned before the first page.
    pub fn start() -> Self {
        Self { token: None, has_more: true }
    }

    pub fn finished() -> Self {
        Self { token: None, has_more: false }
    }

    /// Cursor after a page: more pages exist only when the backend handed
    /// back a continuation token.
    pub fn after_page(token: Option<Vec<u8>>) -> Self {
        let has_more = token.is_some();
        Self { token, has_more }
    }

    pub fn token(&self) -> Option<&[u8]> {
        self.token.as_deref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_finished(&self) -> bool {
        !self.has_more
    }

    /// Opaque form suitable for persisting replay progress.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidCursor(e.to_string()))
    }

    /// Resume from an optional persisted cursor, starting fresh when absent.
    pub fn resume(bytes: Option<&[u8]>) -> Result<Self> {
        match bytes {
            Some(bytes) => Self::from_bytes(bytes),
            None => Ok(Self::start()),
        }
    }
}

impl Default for PagingState {
    fn default() -> Self {
        Self::start()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// Options for reading one aggregate a page at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagingOptions {
    pub take: i32,
    pub paging: PagingState,
    pub order: Order,
}

impl PagingOptions {
    pub fn new(take: i32, order: Order) -> Self {
        Self { take, paging: PagingState::start(), order }
    }

    pub fn with_paging(mut self, paging: PagingState) -> Self {
        self.paging = paging;
        self
    }
}

/// One page of results plus the cursor for the next one.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: PagingState,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: PagingState) -> Self {
        Self { items, next }
    }

    /// The page returned for a terminal cursor.
    pub fn exhausted() -> Self {
        Self { items: Vec::new(), next: PagingState::finished() }
    }
}

/// Raw events of one aggregate page.
pub type LoadedEvents = Page<RawEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_states() {
        assert!(PagingState::start().has_more());
        assert!(PagingState::finished().is_finished());
        assert!(PagingState::after_page(None).is_finished());

        let cursor = PagingState::after_page(Some(vec![1, 2, 3]));
        assert!(cursor.has_more());
        assert_eq!(cursor.token(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_cursor_bytes_are_restorable() {
        let cursor = PagingState::after_page(Some(vec![9, 8, 7]));
        let bytes = cursor.to_bytes().unwrap();
        assert_eq!(PagingState::from_bytes(&bytes).unwrap(), cursor);

        let finished = PagingState::finished().to_bytes().unwrap();
        assert!(PagingState::resume(Some(&finished)).unwrap().is_finished());
        assert_eq!(PagingState::resume(None).unwrap(), PagingState::start());
    }

    #[test]
    fn test_garbage_cursor_is_rejected() {
        let err = PagingState::from_bytes(b"\x00\x01garbage").unwrap_err();
        assert!(matches!(err, StoreError::InvalidCursor(_)));
    }

    #[test]
    fn test_exhausted_page() {
        let page: Page<u8> = Page::exhausted();
        assert!(page.items.is_empty());
        assert!(page.next.is_finished());
    }
}
