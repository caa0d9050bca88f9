pub mod batch_repository;
pub mod delivery_log_repository;
pub mod delta_repository;
pub mod notification_repository;
pub mod preferences_repository;

pub use batch_repository::BatchRepository;
pub use delivery_log_repository::DeliveryLogRepository;
pub use delta_repository::DeltaRepository;
pub use notification_repository::{CreateNotification, NotificationRepository};
pub use preferences_repository::PreferencesRepository;
