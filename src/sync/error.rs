use crate::net::KernelError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("firewall sync failed: {0}")]
    Firewall(#[source] KernelError),

    #[error("ipvs sync failed: {0}")]
    Proxy(#[source] KernelError),

    #[error("vip binding failed: {0}")]
    Vips(#[source] KernelError),

    #[error("route sync failed: {0}")]
    Routes(#[source] KernelError),
}
