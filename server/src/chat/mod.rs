pub mod dispatcher;

pub use dispatcher::{Delivery, DispatchError, Dispatcher, MAX_MESSAGE_LEN};
