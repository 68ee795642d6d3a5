use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::FutureExt;
use keylocker_protocol::{
    constants::UNSUPPORTED_OPERATION,
    keylocker::{
        ChainRequest, GetSocialKeyRep, GetSocialKeyReq, ReturnCode, SetSocialKeyRep,
        SetSocialKeyReq, SupportChainRep, SupportChainReq,
    },
};
use thiserror::Error;

use crate::adaptor::{factory_for, AdaptorContext, AdaptorError, KeyAdaptor, SUPPORTED_CHAINS};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("panic in {method} for chain {chain}: {panic}")]
    AdaptorPanic {
        method: &'static str,
        chain: String,
        panic: String,
        backtrace: String,
    },

    #[error(transparent)]
    Adaptor(#[from] AdaptorError),
}

impl DispatchError {
    /// The local backend has nothing for this identity; peers may.
    pub fn is_key_miss(&self) -> bool {
        matches!(self, Self::Adaptor(AdaptorError::KeyNotFound { .. }))
    }
}

// ============================================================================
// Interceptor
// ============================================================================

thread_local! {
    static LAST_PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records the panicking thread's backtrace so the
/// interceptor can attach it to the resulting error. Idempotent.
pub fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let bt = Backtrace::force_capture().to_string();
            LAST_PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(bt));
            previous(info);
        }));
    });
}

fn take_backtrace() -> String {
    LAST_PANIC_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| "<backtrace unavailable>".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `call` for `req`, logging before and after, and turn a panic inside
/// it into `DispatchError::AdaptorPanic`. Errors from `call` pass through
/// unchanged.
pub async fn intercept<Req, Rep, F>(
    method: &'static str,
    req: &Req,
    call: F,
) -> Result<Rep, DispatchError>
where
    Req: ChainRequest + Debug,
    Rep: Debug,
    F: Future<Output = Result<Rep, DispatchError>>,
{
    let chain = req.chain();
    tracing::info!(method, chain, req = ?req, "Dispatching");

    let result = match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let panic = panic_message(&*payload);
            let backtrace = take_backtrace();
            tracing::error!(method, chain, %panic, "Adaptor panicked\n{backtrace}");
            Err(DispatchError::AdaptorPanic {
                method,
                chain: chain.to_string(),
                panic,
                backtrace,
            })
        }
    };

    match &result {
        Ok(rep) => tracing::debug!(method, chain, resp = ?rep, "Finish handling"),
        Err(e) => tracing::debug!(method, chain, error = %e, "Finish handling"),
    }
    result
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Chain name to adaptor registry. Read-only after construction.
pub struct Dispatcher {
    registry: HashMap<String, Box<dyn KeyAdaptor>>,
}

impl Dispatcher {
    /// Build one adaptor per configured chain. Unknown names and failing
    /// factories are logged and left unregistered.
    pub fn new(chains: &[String], ctx: &AdaptorContext) -> Self {
        install_panic_hook();
        let mut registry: HashMap<String, Box<dyn KeyAdaptor>> = HashMap::new();
        for chain in chains {
            let Some(factory) = factory_for(chain) else {
                tracing::error!(
                    chain = %chain,
                    supported = ?SUPPORTED_CHAINS,
                    "Unsupported chain",
                );
                continue;
            };
            match factory(ctx) {
                Ok(adaptor) => {
                    registry.insert(chain.clone(), adaptor);
                }
                Err(e) => tracing::error!(chain = %chain, "Failed to set up chain: {e}"),
            }
        }
        tracing::info!(chains = ?registry.keys().collect::<Vec<_>>(), "Dispatcher ready");
        Self { registry }
    }

    pub fn from_adaptors(adaptors: impl IntoIterator<Item = Box<dyn KeyAdaptor>>) -> Self {
        install_panic_hook();
        let registry = adaptors
            .into_iter()
            .map(|a| (a.chain().to_string(), a))
            .collect();
        Self { registry }
    }

    pub fn is_supported(&self, chain: &str) -> bool {
        self.registry.contains_key(chain)
    }

    pub fn chains(&self) -> Vec<String> {
        let mut chains: Vec<String> = self.registry.keys().cloned().collect();
        chains.sort();
        chains
    }

    fn route(&self, chain: &str) -> Result<&dyn KeyAdaptor, DispatchError> {
        self.registry
            .get(chain)
            .map(|a| a.as_ref())
            .ok_or_else(|| DispatchError::UnsupportedChain(chain.to_string()))
    }

    pub async fn get_support_chain(
        &self,
        req: &SupportChainReq,
    ) -> Result<SupportChainRep, DispatchError> {
        intercept("GetSupportChain", req, async {
            match self.route(&req.chain) {
                Ok(adaptor) => Ok(adaptor.get_support_chain(req)),
                Err(_) => Ok(SupportChainRep::unsupported(UNSUPPORTED_OPERATION)),
            }
        })
        .await
    }

    pub async fn get_social_key(
        &self,
        req: &GetSocialKeyReq,
    ) -> Result<GetSocialKeyRep, DispatchError> {
        intercept("GetSocialKey", req, async {
            match self.route(&req.chain) {
                Ok(adaptor) => Ok(adaptor.get_social_key(req).await?),
                Err(_) => Ok(GetSocialKeyRep::error(ReturnCode::Unsupported, UNSUPPORTED_OPERATION)),
            }
        })
        .await
    }

    pub async fn set_social_key(
        &self,
        req: &SetSocialKeyReq,
    ) -> Result<SetSocialKeyRep, DispatchError> {
        intercept("SetSocialKey", req, async {
            match self.route(&req.chain) {
                Ok(adaptor) => Ok(adaptor.set_social_key(req).await?),
                Err(_) => Ok(SetSocialKeyRep::error(ReturnCode::Unsupported, UNSUPPORTED_OPERATION)),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::{ETHEREUM, FILECOIN, IPFS};
    use async_trait::async_trait;
    use keylocker_crypto::SymmetricKey;

    struct PanickingAdaptor;

    #[async_trait]
    impl KeyAdaptor for PanickingAdaptor {
        fn chain(&self) -> &str {
            "Panicky"
        }

        fn get_support_chain(&self, _req: &SupportChainReq) -> SupportChainRep {
            panic!("support table corrupted")
        }

        async fn get_social_key(&self, _req: &GetSocialKeyReq) -> Result<GetSocialKeyRep, AdaptorError> {
            panic!("index out of range in backend")
        }

        async fn set_social_key(&self, _req: &SetSocialKeyReq) -> Result<SetSocialKeyRep, AdaptorError> {
            Err(AdaptorError::Backend("ledger offline".into()))
        }
    }

    fn get(chain: &str, uuid: &str) -> GetSocialKeyReq {
        GetSocialKeyReq { chain: chain.into(), uuid: uuid.into(), file_cid: String::new() }
    }

    fn dispatcher() -> Dispatcher {
        let ctx = AdaptorContext::new(SymmetricKey::generate(), 1024);
        Dispatcher::new(&[ETHEREUM.to_string(), FILECOIN.to_string(), "Dogecoin".to_string()], &ctx)
    }

    #[test]
    fn unknown_chain_names_are_skipped() {
        let d = dispatcher();
        assert_eq!(d.chains(), vec![ETHEREUM.to_string(), FILECOIN.to_string()]);
        assert!(!d.is_supported("Dogecoin"));
    }

    #[tokio::test]
    async fn configured_chain_routes_to_its_adaptor() {
        let d = dispatcher();
        let rep = d
            .get_support_chain(&SupportChainReq { chain: ETHEREUM.into() })
            .await
            .unwrap();
        assert_eq!(rep.code, ReturnCode::Success);
        assert!(rep.support);

        let rep = d.get_social_key(&get(FILECOIN, "u1")).await.unwrap();
        assert_eq!(rep.msg, "get filecoin social key success");
    }

    #[tokio::test]
    async fn unconfigured_chain_gets_unsupported_response() {
        let d = dispatcher();
        let rep = d
            .get_support_chain(&SupportChainReq { chain: IPFS.into() })
            .await
            .unwrap();
        assert_eq!(rep.code, ReturnCode::Unsupported);
        assert_eq!(rep.msg, UNSUPPORTED_OPERATION);
        assert!(!rep.support);

        let rep = d.get_social_key(&get("Dogecoin", "u1")).await.unwrap();
        assert_eq!(rep.code, ReturnCode::Unsupported);
        assert!(rep.key_list.is_empty());
    }

    #[tokio::test]
    async fn key_miss_passes_through_unchanged() {
        let d = dispatcher();
        let err = d.get_social_key(&get(ETHEREUM, "u1")).await.unwrap_err();
        assert!(err.is_key_miss());
    }

    #[tokio::test]
    async fn panic_becomes_internal_error_and_serving_continues() {
        let d = Dispatcher::from_adaptors([
            Box::new(PanickingAdaptor) as Box<dyn KeyAdaptor>,
        ]);

        let err = d.get_social_key(&get("Panicky", "u1")).await.unwrap_err();
        match &err {
            DispatchError::AdaptorPanic { method, chain, panic, backtrace } => {
                assert_eq!(*method, "GetSocialKey");
                assert_eq!(chain, "Panicky");
                assert_eq!(panic, "index out of range in backend");
                assert!(!backtrace.is_empty());
            }
            other => panic!("expected AdaptorPanic, got {other:?}"),
        }
        assert!(!err.is_key_miss());

        // Sync panics inside the call are caught too.
        let err = d
            .get_support_chain(&SupportChainReq { chain: "Panicky".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AdaptorPanic { .. }));

        // The same dispatcher keeps serving.
        let err = d
            .set_social_key(&SetSocialKeyReq {
                chain: "Panicky".into(),
                uuid: "u1".into(),
                key: "k".into(),
                password: String::new(),
                social_code: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Adaptor(AdaptorError::Backend(_))));
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }
}
