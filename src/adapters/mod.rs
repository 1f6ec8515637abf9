use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::share::ShareConnector;

mod mounted;
pub mod simulated;

pub use mounted::MountedShareConnector;
pub use simulated::SimulatedNetwork;

pub fn get_connector(config: &AppConfig) -> Arc<dyn ShareConnector> {
    Arc::new(MountedShareConnector::new(&config.mount_root))
}
