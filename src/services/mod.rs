pub mod notifier;
pub mod payment;
pub mod reservation;
pub mod users;
