pub mod contacts;
pub mod lanes;
pub mod router;

pub use contacts::ContactBook;
pub use lanes::{FairQueue, Origin};
pub use router::{Conversation, ConversationRouter};
