mod controller;
mod error;
mod extractor;
mod handlers;

pub use controller::{
    link_browser_to_queue, Collaborators, ControllerConfig, CrawlController, CrawlStats,
};
pub use error::CrawlError;
pub use extractor::MapsExtractor;
pub use handlers::TaskPayload;
