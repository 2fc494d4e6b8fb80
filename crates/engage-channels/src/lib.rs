pub mod attempts;
pub mod dispatch;
pub mod loopback;
pub mod pricing;

pub use attempts::{AttemptJournal, AttemptOutcome, DispatchAttempt};
pub use dispatch::{validate_destination, ChannelDispatcher, DispatchRequest, DispatchResult};
pub use loopback::LoopbackProvider;
pub use pricing::{sms_segments, Pricing, SmsEncoding};
