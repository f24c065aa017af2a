pub mod load_balancer;

pub use load_balancer::{BalanceError, LoadBalancer, LoadBalancerState, SelectedChannel};
