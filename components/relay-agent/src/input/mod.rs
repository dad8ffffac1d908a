pub mod http;
pub mod ratelimit;
pub mod syslog;

/// Shared behavior of the network inputs. The wiring layer is the only
/// place iterating heterogeneous inputs, so dynamic dispatch stops there.
#[async_trait::async_trait]
pub trait Input: Send + Sync {
    fn name(&self) -> &'static str;
    /// Bind listeners and spawn the serving tasks.
    async fn start(&self) -> anyhow::Result<()>;
    /// Stop serving and wait for in-flight handlers.
    async fn stop(&self);
    fn healthy(&self) -> bool;
}
