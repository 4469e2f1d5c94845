pub mod browser_middleware;
pub mod config;
pub mod error;
pub mod extractor;
pub mod filters;
pub mod proxy;
pub mod session;
pub mod types;
pub mod utils;

pub use browser_middleware::{
    collect_launch_args, DefaultLaunchArgsMiddleware, LaunchArgsMiddleware,
};
pub use config::*;
pub use error::{BrowserError, PageError, PageErrorKind, SessionError};
pub use extractor::{
    CachedCapabilityChecker, CapabilityChecker, CapabilityResult, DetailFields,
    DisabledCapabilityChecker, Extractor, ListingNode,
};
pub use filters::{apply_filters, FilterSet};
pub use proxy::{ProxyProvider, ProxyScheme, RelayEndpoint, RelayRegistry};
pub use session::*;
pub use types::*;
