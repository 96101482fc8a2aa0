use thiserror::Error;

/// Rejection reasons for malformed events.
///
/// Events failing validation are dropped before they ever reach the inbound
/// queue, so these errors are reported to the caller of `notify_*` / `inject`
/// and never observed by consumers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EventValidationError {
    /// pointer count outside `1..=MAX_POINTERS`
    #[error("invalid pointer count: `{0}`")]
    InvalidPointerCount(usize),
    /// pointer properties and coords arrays differ in length
    #[error("mismatched pointer arrays: {properties} properties, {coords} coords")]
    MismatchedPointerArrays { properties: usize, coords: usize },
    /// pointer id above MAX_POINTER_ID
    #[error("invalid pointer id: `{0}`")]
    InvalidPointerId(u8),
    /// the same pointer id appears twice in one event
    #[error("duplicate pointer id: `{0}`")]
    DuplicatePointerId(u8),
    /// pointer-down / pointer-up index outside the pointer array
    #[error("pointer index `{index}` out of range for {count} pointers")]
    InvalidPointerIndex { index: usize, count: usize },
}
