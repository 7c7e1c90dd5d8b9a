//! Tributary process configuration object and helpers.
mod loading;
mod object;

pub use self::loading::load;
pub use self::loading::Error;
pub use self::object::Conf;
pub use self::object::ConnectSection;
pub use self::object::MonitoringConf;
pub use self::object::PerformanceConf;
pub use self::object::PgLogicalSection;
pub use self::object::SourceFailurePolicy;
pub use self::object::StoreConf;
pub use self::object::SyncMode;
pub use self::object::TasksSection;
