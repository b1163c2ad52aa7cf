// tests/common/mod.rs

#![allow(dead_code)]

use bytes::Bytes;
use duplex_rpc::{handler_fn, HandlerPtr};

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;
    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}

/// Handler that replies with the request payload followed by `/answer`.
pub fn answer() -> HandlerPtr {
    handler_fn(|payload: Bytes| async move {
        // ---
        let mut out = payload.to_vec();
        out.extend_from_slice(b"/answer");
        Ok(Bytes::from(out))
    })
}
