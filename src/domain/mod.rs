mod campaign;
mod delivery;
mod event;
mod subscriber_email;
mod subscription;
mod suppression;

pub use campaign::*;
pub use delivery::*;
pub use event::*;
pub use subscriber_email::*;
pub use subscription::*;
pub use suppression::*;
