pub mod monitor;
pub mod notify;
pub mod policy;
pub mod tester;

pub use monitor::HealthMonitor;
pub use notify::{Notifier, notifier_from_config};
pub use policy::ChannelPolicy;
pub use tester::{ChannelProbe, ChannelTester, TestKind, TestResult};
