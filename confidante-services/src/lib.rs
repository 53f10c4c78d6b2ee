pub mod dispatch;
pub mod hosts;
pub mod presence;
pub mod router;
