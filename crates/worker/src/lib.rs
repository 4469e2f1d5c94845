mod browser_manager;
mod chrome;
mod driver;
mod metrics;
mod task_queue;

pub mod providers;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use browser_manager::{BrowserEvent, BrowserManager};
pub use chrome::{ChromeBrowser, ChromeDriver, ChromePage};
pub use driver::{BrowserDriver, BrowserHandle, LaunchSpec, PageHandle};
pub use metrics::Metrics;
pub use task_queue::{Completion, Dispatch, EnqueueOptions, QueueEvent, Task, TaskQueue};
