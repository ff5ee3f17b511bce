pub mod call;
pub mod sms;
pub mod contact;
pub mod business;
pub mod decision;
pub mod appointment;
pub mod event;

pub use call::*;
pub use sms::*;
pub use contact::*;
pub use business::*;
pub use decision::*;
pub use appointment::*;
pub use event::*;
