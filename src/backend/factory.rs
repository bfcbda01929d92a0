//! Production [`ConnectionFactory`]: one [`ConnectionGroup`] per descriptor.

use crate::backend::{
    BackendError, BackendTimeouts, ConnectionFactory, ConnectionGroup, ConnectionHandle,
};
use crate::session::ConnectionDescriptor;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct RespConnectionFactory {
    timeouts: BackendTimeouts,
}

impl RespConnectionFactory {
    pub fn new(timeouts: BackendTimeouts) -> Self {
        Self { timeouts }
    }

    pub fn timeouts(&self) -> &BackendTimeouts {
        &self.timeouts
    }
}

#[async_trait]
impl ConnectionFactory for RespConnectionFactory {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle, BackendError> {
        let group = ConnectionGroup::new(descriptor.clone(), self.timeouts.clone());
        group.warm_up().await?;

        debug!(
            backend = %descriptor.address(),
            pool_size = descriptor.tuning().pool_size,
            "Connection group created"
        );
        Ok(Arc::new(group))
    }
}
