mod campaign;
mod delivery;
mod event;
mod subscription;
mod suppression;
mod user;

pub use campaign::*;
pub use delivery::*;
pub use event::*;
pub use subscription::*;
pub use suppression::*;
pub use user::*;
