// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates caching per-device data in a `ScopedCache` bound to the device's connection.
//!
//! Device properties are fetched in the background: the first caller gets an empty placeholder
//! right away, while later callers see the real properties. The transport is stored under a
//! releasable key, so it is shut down when the connection scope ends.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use scoped_cache::{Key, ReleaseError, Releasable, ScopedCache, Scope};

#[derive(Debug)]
struct Transport {
    serial: &'static str,
    open: AtomicBool,
}

impl Releasable for Transport {
    fn release(&self) -> Result<(), ReleaseError> {
        println!("  Closing transport to {}", self.serial);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let connection = Scope::builder().name("emulator-5554").build();
    let cache = ScopedCache::builder(&connection).name("device emulator-5554").build();

    let transport_key: Key<Arc<Transport>> = Key::new("transport").releasable();
    let properties_key: Key<Arc<str>> = Key::new("device properties");
    let fetches = Arc::new(AtomicUsize::new(0));

    let transport = cache.get_or_put(&transport_key, || {
        Arc::new(Transport {
            serial: "emulator-5554",
            open: AtomicBool::new(true),
        })
    });

    for round in 1..=3 {
        let fetches = Arc::clone(&fetches);
        let properties = cache
            .get_or_put_async_fast(&properties_key, || Arc::from(""), move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);

                // Simulate a slow round trip to the device
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, io::Error>(Arc::from("ro.product.model=sdk_gphone64,ro.build.version.sdk=34"))
            })
            .await
            .expect("fetching device properties failed");

        println!("[Round {round}] properties: {properties:?}");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    println!("\nDisconnecting the device...");
    connection.close().await;

    let total_fetches = fetches.load(Ordering::SeqCst);
    println!("Properties fetched {total_fetches} time(s) for 3 rounds.");
    println!("Transport open after disconnect: {}", transport.open.load(Ordering::SeqCst));
}
