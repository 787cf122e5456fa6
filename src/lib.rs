mod error;

pub mod gateway;
pub mod providers;
pub mod utils;

pub use error::{DispatchError, Result};

pub use gateway::{
    ChatMessage, Clock, ContentPart, Dispatcher, Gateway, GatewayError, HttpDispatcher, ImageUrl,
    MessageContent, RequestContext, SystemClock,
};
