use std::fmt::Debug;

/// Middleware for modifying browser launch arguments
///
/// Implement this trait to customize the command-line arguments passed to
/// the browser before every launch (including restarts after a crash).
/// Middlewares run in order and each one can append arguments.
///
/// # Example
///
/// ```rust,ignore
/// use scrape_hive_common::browser_middleware::LaunchArgsMiddleware;
///
/// #[derive(Debug, Clone)]
/// struct FixedWindow;
///
/// impl LaunchArgsMiddleware for FixedWindow {
///     fn apply_args(&self, args: &mut Vec<String>, _headless: bool) {
///         args.push("--window-size=1366,768".to_string());
///     }
///
///     fn name(&self) -> &str {
///         "fixed_window"
///     }
///
///     fn clone_box(&self) -> Box<dyn LaunchArgsMiddleware> {
///         Box::new(self.clone())
///     }
/// }
/// ```
pub trait LaunchArgsMiddleware: Debug + Send + Sync {
    /// Append launch arguments
    ///
    /// # Parameters
    /// * `args` - Arguments collected so far
    /// * `headless` - Whether the browser is launched without a window
    fn apply_args(&self, args: &mut Vec<String>, headless: bool);

    /// Get unique identifier for this middleware (used in logging)
    fn name(&self) -> &str;

    /// Clone this middleware into a Box
    fn clone_box(&self) -> Box<dyn LaunchArgsMiddleware>;
}

/// Make Box<dyn LaunchArgsMiddleware> cloneable
impl Clone for Box<dyn LaunchArgsMiddleware> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Arguments every launch needs in a container runtime.
///
/// The namespace sandbox needs SYS_ADMIN, so it is switched off together
/// with the setuid helper and zygote; shared memory and GPU paths are
/// disabled because containers rarely provide them.
#[derive(Debug, Clone)]
pub struct DefaultLaunchArgsMiddleware;

impl LaunchArgsMiddleware for DefaultLaunchArgsMiddleware {
    fn apply_args(&self, args: &mut Vec<String>, headless: bool) {
        for arg in [
            "--no-sandbox",
            "--disable-setuid-sandbox",
            "--disable-dev-shm-usage",
            "--disable-accelerated-2d-canvas",
            "--no-first-run",
            "--no-zygote",
            "--disable-gpu",
        ] {
            args.push(arg.to_string());
        }

        if !headless {
            args.push("--start-maximized".to_string());
        }
    }

    fn name(&self) -> &str {
        "default_launch_args"
    }

    fn clone_box(&self) -> Box<dyn LaunchArgsMiddleware> {
        Box::new(self.clone())
    }
}

/// Run every middleware in order and return the collected arguments
pub fn collect_launch_args(
    middlewares: &[Box<dyn LaunchArgsMiddleware>],
    headless: bool,
) -> Vec<String> {
    let mut args = Vec::new();
    for middleware in middlewares {
        middleware.apply_args(&mut args, headless);
    }
    args
}
