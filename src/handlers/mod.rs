mod health;
mod hello;
mod report;

pub use health::health_handler;
pub use hello::hello_handler;
pub use report::report_handler;
