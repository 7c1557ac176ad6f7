//! `CredentialSource` over the key pool alone
//!
//! Used when the client runs in public mode without a router, and by the
//! router itself for its pooled half.

use transport::{Credential, CredentialOrigin, CredentialSource, SourceError, SourceFuture};
use tracing::warn;

use crate::pool::KeyPool;

impl CredentialSource for KeyPool {
    fn id(&self) -> &str {
        "pool"
    }

    fn acquire(&self) -> SourceFuture<'_, Result<Credential, SourceError>> {
        Box::pin(async move {
            match self.next_available().await {
                Some(key) => Ok(Credential {
                    secret: key.secret,
                    origin: CredentialOrigin::Pool { slot: key.slot },
                }),
                None => Err(SourceError::Exhausted(self.exhausted_message().await)),
            }
        })
    }

    fn record_success(&self, origin: CredentialOrigin) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            let CredentialOrigin::Pool { slot } = origin else {
                return;
            };
            if let Err(e) = self.record_usage(slot).await {
                warn!(slot, error = %e, "could not record key usage");
            }
        })
    }

    fn report_exhausted(&self, origin: CredentialOrigin) -> SourceFuture<'_, Option<Credential>> {
        Box::pin(async move {
            let CredentialOrigin::Pool { slot } = origin else {
                return None;
            };
            match self.mark_exhausted(slot).await {
                Ok(replacement) => replacement.map(|key| Credential {
                    secret: key.secret,
                    origin: CredentialOrigin::Pool { slot: key.slot },
                }),
                Err(e) => {
                    warn!(slot, error = %e, "could not mark key exhausted");
                    None
                }
            }
        })
    }
}
