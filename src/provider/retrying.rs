//! Retry decoration for provider calls.
//!
//! Wraps every operation of an inner [`CloudProvider`] with the bounded
//! backoff policy from [`crate::retry`]. Only errors whose structured kind
//! is retryable are re-attempted; exhausting the budget escalates the last
//! transient error to a fatal one with the attempt history in the message.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::retry::{RetryExhausted, RetryPolicy, Sleeper, TokioSleeper, retry};

use super::{
    CloudProvider, ConsoleOutput, DiskInfo, DiskSpec, ImageInfo, ImageSpec, InstanceInfo,
    LaunchSpec, NetworkInfo, ProviderError, ProviderFuture, SecurityGroupInfo, SnapshotInfo,
    SubnetInfo,
};

/// Provider decorator applying the retry policy to every call.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl<P: CloudProvider> RetryingProvider<P> {
    /// Wraps `inner` with the given policy and the real tokio sleeper.
    #[must_use]
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replaces the sleeper. Tests use this to skip real backoff delays.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Returns the wrapped provider.
    pub fn into_inner(self) -> P {
        self.inner
    }

    async fn call<'a, T, F, Fut>(&'a self, label: &str, operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>> + 'a,
    {
        retry(
            &self.policy,
            self.sleeper.as_ref(),
            label,
            ProviderError::is_retryable,
            operation,
        )
        .await
        .map_err(|(err, exhausted)| escalate(label, err, exhausted))
    }
}

fn escalate(label: &str, err: ProviderError, exhausted: Option<RetryExhausted>) -> ProviderError {
    match exhausted {
        None => err,
        Some(detail) => ProviderError {
            kind: err.kind,
            message: format!(
                "{label}: retry budget exhausted after {} attempts in {:?}: {}",
                detail.attempts, detail.elapsed, err.message
            ),
        },
    }
}

impl<P: CloudProvider> CloudProvider for RetryingProvider<P> {
    fn get_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ImageInfo> {
        Box::pin(self.call("get_image", move || self.inner.get_image(image_id)))
    }

    fn find_images<'a>(
        &'a self,
        name: &'a str,
        owned_by_self: bool,
    ) -> ProviderFuture<'a, Vec<ImageInfo>> {
        Box::pin(self.call("find_images", move || {
            self.inner.find_images(name, owned_by_self)
        }))
    }

    fn run_instance<'a>(&'a self, spec: &'a LaunchSpec) -> ProviderFuture<'a, InstanceInfo> {
        Box::pin(self.call("run_instance", move || self.inner.run_instance(spec)))
    }

    fn get_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceInfo> {
        Box::pin(self.call("get_instance", move || self.inner.get_instance(instance_id)))
    }

    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("stop_instance", move || {
            self.inner.stop_instance(instance_id)
        }))
    }

    fn delete_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("delete_instance", move || {
            self.inner.delete_instance(instance_id)
        }))
    }

    fn create_disk<'a>(&'a self, spec: &'a DiskSpec) -> ProviderFuture<'a, DiskInfo> {
        Box::pin(self.call("create_disk", move || self.inner.create_disk(spec)))
    }

    fn get_disk<'a>(&'a self, disk_id: &'a str) -> ProviderFuture<'a, DiskInfo> {
        Box::pin(self.call("get_disk", move || self.inner.get_disk(disk_id)))
    }

    fn delete_disk<'a>(&'a self, disk_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("delete_disk", move || self.inner.delete_disk(disk_id)))
    }

    fn attach_disk<'a>(
        &'a self,
        instance_id: &'a str,
        disk_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("attach_disk", move || {
            self.inner.attach_disk(instance_id, disk_id, device)
        }))
    }

    fn detach_disk<'a>(
        &'a self,
        instance_id: &'a str,
        disk_id: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("detach_disk", move || {
            self.inner.detach_disk(instance_id, disk_id)
        }))
    }

    fn create_snapshot<'a>(
        &'a self,
        disk_id: &'a str,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, SnapshotInfo> {
        Box::pin(self.call("create_snapshot", move || {
            self.inner.create_snapshot(disk_id, name, description)
        }))
    }

    fn get_snapshot<'a>(&'a self, snapshot_id: &'a str) -> ProviderFuture<'a, SnapshotInfo> {
        Box::pin(self.call("get_snapshot", move || {
            self.inner.get_snapshot(snapshot_id)
        }))
    }

    fn delete_snapshot<'a>(&'a self, snapshot_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("delete_snapshot", move || {
            self.inner.delete_snapshot(snapshot_id)
        }))
    }

    fn register_image<'a>(&'a self, spec: &'a ImageSpec) -> ProviderFuture<'a, ImageInfo> {
        Box::pin(self.call("register_image", move || self.inner.register_image(spec)))
    }

    fn delete_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("delete_image", move || self.inner.delete_image(image_id)))
    }

    fn create_security_group<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
        network_id: Option<&'a str>,
        open_port: u16,
    ) -> ProviderFuture<'a, SecurityGroupInfo> {
        Box::pin(self.call("create_security_group", move || {
            self.inner
                .create_security_group(name, description, network_id, open_port)
        }))
    }

    fn delete_security_group<'a>(&'a self, group_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("delete_security_group", move || {
            self.inner.delete_security_group(group_id)
        }))
    }

    fn get_subnet<'a>(&'a self, subnet_id: &'a str) -> ProviderFuture<'a, SubnetInfo> {
        Box::pin(self.call("get_subnet", move || self.inner.get_subnet(subnet_id)))
    }

    fn get_network<'a>(&'a self, network_id: &'a str) -> ProviderFuture<'a, NetworkInfo> {
        Box::pin(self.call("get_network", move || self.inner.get_network(network_id)))
    }

    fn get_security_group<'a>(
        &'a self,
        group_id: &'a str,
    ) -> ProviderFuture<'a, SecurityGroupInfo> {
        Box::pin(self.call("get_security_group", move || {
            self.inner.get_security_group(group_id)
        }))
    }

    fn create_tags<'a>(
        &'a self,
        resource_id: &'a str,
        tags: &'a BTreeMap<String, String>,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(self.call("create_tags", move || {
            self.inner.create_tags(resource_id, tags)
        }))
    }

    fn get_console_output<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, ConsoleOutput> {
        Box::pin(self.call("get_console_output", move || {
            self.inner.get_console_output(instance_id)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeProvider;
    use crate::provider::ProviderErrorKind;
    use crate::retry::NoopSleeper;
    use std::time::Duration;

    fn wrapped(fake: FakeProvider) -> RetryingProvider<FakeProvider> {
        RetryingProvider::new(
            fake,
            RetryPolicy {
                max_elapsed: Duration::from_millis(50),
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(1),
            },
        )
        .with_sleeper(Arc::new(NoopSleeper))
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let fake = FakeProvider::new();
        fake.seed_subnet("subnet-1", "vpc-1", "zone-a");
        fake.fail_next(
            "get_subnet",
            ProviderError::new(ProviderErrorKind::Throttled, "slow down"),
        );
        let provider = wrapped(fake);
        let subnet = provider
            .get_subnet("subnet-1")
            .await
            .expect("retry should recover");
        assert_eq!(subnet.network_id, "vpc-1");
    }

    #[tokio::test]
    async fn fatal_failures_pass_through() {
        let fake = FakeProvider::new();
        fake.fail_next(
            "get_subnet",
            ProviderError::new(ProviderErrorKind::AuthFailure, "bad key"),
        );
        let provider = wrapped(fake);
        let err = provider
            .get_subnet("subnet-1")
            .await
            .expect_err("auth failure should not retry");
        assert_eq!(err.kind, ProviderErrorKind::AuthFailure);
    }
}
