use std::sync::Arc;

use keylocker_protocol::keylocker::{
    GetSocialKeyRep, GetSocialKeyReq, SetSocialKeyRep, SetSocialKeyReq, SupportChainRep,
    SupportChainReq,
};
use thiserror::Error;

use crate::{
    dispatcher::{DispatchError, Dispatcher},
    relay::{FaultTolerance, RelayError},
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("relay failed: {0}")]
    Relay(#[source] RelayError),
}

/// Front door for the three operations. A get that misses locally is relayed
/// to peers when a relay is configured.
pub struct KeyService {
    dispatcher: Arc<Dispatcher>,
    relay: Option<Arc<FaultTolerance>>,
}

impl KeyService {
    pub fn new(dispatcher: Arc<Dispatcher>, relay: Option<Arc<FaultTolerance>>) -> Self {
        Self { dispatcher, relay }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn get_support_chain(&self, req: &SupportChainReq) -> Result<SupportChainRep, ServiceError> {
        Ok(self.dispatcher.get_support_chain(req).await?)
    }

    pub async fn set_social_key(&self, req: &SetSocialKeyReq) -> Result<SetSocialKeyRep, ServiceError> {
        Ok(self.dispatcher.set_social_key(req).await?)
    }

    /// Local lookup first. On a key miss, ask peers; if none answers in time
    /// the local error is returned.
    pub async fn get_social_key(&self, req: &GetSocialKeyReq) -> Result<GetSocialKeyRep, ServiceError> {
        let local_err = match self.dispatcher.get_social_key(req).await {
            Ok(rep) => return Ok(rep),
            Err(e) => e,
        };

        let Some(relay) = self.relay.as_ref().filter(|_| local_err.is_key_miss()) else {
            return Err(local_err.into());
        };

        tracing::info!(chain = %req.chain, uuid = %req.uuid, "Key not held locally, relaying");
        match relay.get_social_key(req).await {
            Ok(rep) => Ok(rep),
            Err(RelayError::Timeout) => Err(local_err.into()),
            Err(e) => Err(ServiceError::Relay(e)),
        }
    }
}
