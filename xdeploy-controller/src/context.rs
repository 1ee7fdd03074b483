use crate::config::ControllerConfig;
use crate::metrics::ControllerMetrics;

pub(crate) struct Context<S, D> {
    pub store: S,
    pub driver: D,
    pub config: ControllerConfig,
    pub metrics: ControllerMetrics,
}
