//! HTTP request handlers.

mod checkdns;
mod health;
mod intake;

pub use checkdns::{check_dns, DebounceMap};
pub use health::healthz;
pub use intake::{create_email_request, create_ui_request};
