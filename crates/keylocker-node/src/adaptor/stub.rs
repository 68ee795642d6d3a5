use async_trait::async_trait;
use keylocker_protocol::keylocker::{
    GetSocialKeyRep, GetSocialKeyReq, ReturnCode, SetSocialKeyRep, SetSocialKeyReq,
    SupportChainRep, SupportChainReq,
};

use super::{AdaptorContext, AdaptorError, KeyAdaptor, FILECOIN};

/// Placeholder backend: accepts every request and stores nothing.
pub struct StubAdaptor {
    chain: &'static str,
}

pub fn filecoin(_ctx: &AdaptorContext) -> Result<Box<dyn KeyAdaptor>, AdaptorError> {
    Ok(Box::new(StubAdaptor { chain: FILECOIN }))
}

#[async_trait]
impl KeyAdaptor for StubAdaptor {
    fn chain(&self) -> &str {
        self.chain
    }

    fn get_support_chain(&self, _req: &SupportChainReq) -> SupportChainRep {
        SupportChainRep {
            code: ReturnCode::Success,
            msg: "get support chain success".into(),
            support: true,
        }
    }

    async fn get_social_key(&self, _req: &GetSocialKeyReq) -> Result<GetSocialKeyRep, AdaptorError> {
        Ok(GetSocialKeyRep {
            code: ReturnCode::Success,
            msg: format!("get {} social key success", self.chain.to_lowercase()),
            key_list: Vec::new(),
        })
    }

    async fn set_social_key(&self, _req: &SetSocialKeyReq) -> Result<SetSocialKeyRep, AdaptorError> {
        Ok(SetSocialKeyRep {
            code: ReturnCode::Success,
            msg: format!("set {} social key success", self.chain.to_lowercase()),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_always_succeeds_empty() {
        let a = StubAdaptor { chain: FILECOIN };
        let rep = a
            .get_social_key(&GetSocialKeyReq {
                chain: FILECOIN.into(),
                uuid: "u1".into(),
                file_cid: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(rep.code, ReturnCode::Success);
        assert!(rep.key_list.is_empty());
    }
}
