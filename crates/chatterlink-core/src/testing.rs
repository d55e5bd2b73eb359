use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::TcpStream;

use chatterlink_net::{AnonymizingTransport, FetchResponse, NetError};

/// In-process anonymizer that hands out fake onion addresses.
#[derive(Debug, Default)]
pub struct StubAnonymizer {
    active: AtomicBool,
    fail_endpoints: bool,
}

impl StubAnonymizer {
    pub fn failing_endpoints() -> Self {
        Self {
            active: AtomicBool::new(false),
            fail_endpoints: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnonymizingTransport for StubAnonymizer {
    async fn initialize(&self) -> chatterlink_net::Result<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_hidden_endpoint(&self, port: u16) -> chatterlink_net::Result<String> {
        if self.fail_endpoints {
            return Err(NetError::Tor("ADD_ONION refused".into()));
        }
        Ok(format!("stub-{port}.onion"))
    }

    async fn connect(&self, address: &str) -> chatterlink_net::Result<TcpStream> {
        Err(NetError::Tor(format!("stub cannot reach {address}")))
    }

    async fn fetch(&self, url: &str) -> chatterlink_net::Result<FetchResponse> {
        Err(NetError::Tor(format!("stub cannot fetch {url}")))
    }

    async fn cleanup(&self) -> chatterlink_net::Result<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}
