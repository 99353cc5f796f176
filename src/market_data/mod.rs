pub mod directory;
pub mod order_book;
pub mod tape;

pub use directory::{BookDirectory, BookParams};
pub use order_book::{BookError, BookLevel, BookSnapshot, InvalidReason, OrderBookState};
pub use tape::{TapeRing, TapeStats};
