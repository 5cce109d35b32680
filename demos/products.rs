//! Product catalogue example: declarative endpoints over an in-memory transport.

use query_kit::{
    error::Result, EndpointDefinition, EndpointRegistry, FetchPolicy, InMemoryTransport,
    QueryClient, QuerySnapshot, RequestDescriptor,
};
use serde_json::json;
use std::time::Duration;

const BASE_URL: &str = "https://dummyjson.com/";

fn products_api() -> Result<EndpointRegistry> {
    EndpointRegistry::builder("productsApi")
        .base_url(BASE_URL)
        .endpoint(EndpointDefinition::query("getAllProducts", |_: ()| {
            RequestDescriptor::get("products")
        }))
        .endpoint(
            EndpointDefinition::query("getProduct", |product: String| {
                RequestDescriptor::get(format!("products/search?q={}", product))
            })
            .keep_unused_data_for(Duration::from_secs(5)),
        )
        .build()
}

/// Canned dummyjson.com responses with a bit of latency.
fn transport() -> InMemoryTransport {
    let transport = InMemoryTransport::new().with_latency(Duration::from_millis(50));
    transport.respond_json(
        "https://dummyjson.com/products",
        json!({
            "products": [
                {"id": 1, "title": "iPhone 9", "price": 549},
                {"id": 2, "title": "iPhone X", "price": 899},
                {"id": 3, "title": "Samsung Universe 9", "price": 1249},
            ],
            "total": 3,
        }),
    );
    transport.respond_json(
        "https://dummyjson.com/products/search?q=iphone",
        json!({"products": [{"id": 1, "title": "iPhone 9"}, {"id": 2, "title": "iPhone X"}]}),
    );
    transport.fail(
        "https://dummyjson.com/products/search?q=broken",
        json!({"code": 500}),
    );
    transport
}

fn describe(label: &str, snapshot: &QuerySnapshot) {
    println!(
        "   [{}] {} (request {}, fetching: {})",
        label,
        snapshot.status,
        snapshot.request_id,
        snapshot.is_fetching()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Query Kit - Products Example ===\n");

    // 1. Client setup
    println!("1. Creating client for {}...", BASE_URL);
    let transport = transport();
    let client = QueryClient::new(products_api()?, transport.clone())?;
    println!("   ✓ {} endpoints registered\n", client.registry().len());

    // 2. Subscribe: Idle -> Loading -> Success
    println!("2. Subscribing to getAllProducts:");
    let all_products = client.subscribe("getAllProducts", &(), |s| describe("list", s))?;
    let snapshot = client.fetch("getAllProducts", &()).await?;
    if let Some(data) = &snapshot.data {
        println!("   ✓ {} products loaded\n", data["total"]);
    }

    // 3. Two components asking for the same product share one request
    println!("3. Two subscribers for getProduct(\"iphone\"):");
    let first = client.subscribe("getProduct", "iphone", |s| describe("detail A", s))?;
    let second = client.subscribe("getProduct", "iphone", |s| describe("detail B", s))?;
    client.fetch("getProduct", "iphone").await?;
    println!(
        "   ✓ transport calls for the search: {}\n",
        transport.calls_for("https://dummyjson.com/products/search?q=iphone")
    );

    // 4. Failures land in the snapshot
    println!("4. Fetching a failing query:");
    let broken = client.fetch("getProduct", "broken").await?;
    if let Some(error) = &broken.error {
        println!("   ✓ Error captured: {}\n", error);
    }

    // 5. Explicit refetch of a cached key
    println!("5. Refetching getAllProducts:");
    let mut watch = client.watch("getAllProducts", &())?;
    let before = watch.current().request_id;
    client.refetch(watch.key())?;
    let after = watch.wait_for(|s| s.is_success() && s.request_id > before).await?;
    println!("   ✓ Request {} replaced request {}\n", after.request_id, before);

    // 6. Cache-only observation
    println!("6. Cache-only subscription:");
    let observer = client.subscribe_with(
        "getProduct",
        "iphone",
        FetchPolicy::CacheOnly,
        |s| describe("cache-only", s),
    )?;
    drop(observer);
    println!();

    // 7. Releasing subscribers arms the collection timers
    println!("7. Releasing all subscribers:");
    drop(first);
    drop(second);
    drop(all_products);
    drop(watch);
    println!("   {:?}", client.stats());

    tokio::time::sleep(Duration::from_secs(6)).await;
    let key = client.cache_key("getProduct", "iphone")?;
    println!(
        "   ✓ getProduct(\"iphone\") collected after 5s: {}",
        !client.store().contains(&key)
    );
    println!("   {:?}\n", client.stats());

    println!("=== Example Complete ===\n");
    Ok(())
}
