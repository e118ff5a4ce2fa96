//! Season calendar and the seasonal trait archive.

pub mod archive;
mod tag;

pub use archive::SeasonScope;
pub use tag::SeasonCalendar;
