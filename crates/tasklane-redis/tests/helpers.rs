use std::sync::Once;
use std::time::Duration;
use tasklane_redis::{RedisClient, RedisConfig};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_test_writer().init();
    });
}

/// A throwaway Redis server without persistence, one per test.
pub struct TestRedis {
    container: Option<ContainerAsync<GenericImage>>,
    url: String,
}

impl TestRedis {
    pub async fn start() -> Self {
        let container = GenericImage::new("redis", "7.4-alpine")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections tcp"))
            .with_cmd(["redis-server", "--save", "", "--appendonly", "no"])
            .start()
            .await
            .expect("Failed to start Redis");
        let host = container.get_host().await.expect("container host");
        let port = container.get_host_port_ipv4(6379).await.expect("mapped port");
        let url = format!("redis://{host}:{port}/");
        tracing::info!(%url, "Started Redis testcontainer");
        Self {
            container: Some(container),
            url,
        }
    }

    /// A client using the default key prefix.
    pub async fn client(&self) -> RedisClient {
        self.client_with_prefix("tasklane:").await
    }

    /// A client whose keys live under `prefix`, as a second deployment sharing the server would.
    pub async fn client_with_prefix(&self, prefix: &str) -> RedisClient {
        let config = RedisConfig::new(self.url.clone())
            .with_connection_timeout(Duration::from_secs(2))
            .with_key_prefix(prefix);
        RedisClient::new(config).await.expect("redis client")
    }

    pub async fn cleanup(&mut self) {
        if let Some(container) = self.container.take() {
            container
                .rm()
                .await
                .expect("Failed to remove Redis container");
        }
    }
}
