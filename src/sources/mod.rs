//! Concrete gallery sources.

pub mod paged;
pub mod scroll;
#[cfg(feature = "webdriver")]
pub mod webdriver;

pub use paged::{PagedApiSource, PagedSourceConfig};
pub use scroll::{ImageElement, ScrollPage, ScrollSource, ScrollSourceConfig};
#[cfg(feature = "webdriver")]
pub use webdriver::WebDriverPage;
