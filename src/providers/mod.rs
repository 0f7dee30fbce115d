//! Concrete [`ProviderAdapter`](crate::connector::ProviderAdapter)
//! implementations for the five supported provider shapes.

pub mod code_hosting;
pub mod feed;
pub mod mail_calendar;
pub mod microblog;
pub mod social;

pub use code_hosting::CodeHostingAdapter;
pub use feed::FeedAdapter;
pub use mail_calendar::{MailCalendarAdapter, MailCalendarResource};
pub use microblog::MicroblogAdapter;
pub use social::SocialLinkAdapter;
