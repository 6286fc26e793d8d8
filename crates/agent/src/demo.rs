//! In-memory shop used by the CLI and the test suites.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use clerk_core::domain::tool::ToolError;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::tools::{ProductQuery, ShopBackend, ShopTool};

#[derive(Clone, Debug)]
struct Product {
    id: &'static str,
    name: &'static str,
    brand: &'static str,
    category: &'static str,
    price_cents: i64,
    color: &'static str,
    sizes: &'static [&'static str],
    in_stock: bool,
}

#[derive(Clone, Debug)]
struct Order {
    id: &'static str,
    email: &'static str,
    status: &'static str,
    items: &'static [&'static str],
    tracking: Option<&'static str>,
    estimated_delivery: Option<&'static str>,
}

const PRODUCTS: &[Product] = &[
    Product {
        id: "sony-wh-ch720n",
        name: "Sony WH-CH720N Wireless Noise Cancelling Headphones",
        brand: "Sony",
        category: "headphones",
        price_cents: 8_999,
        color: "black",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "sony-mdr-zx110",
        name: "Sony MDR-ZX110 On-Ear Headphones",
        brand: "Sony",
        category: "headphones",
        price_cents: 1_999,
        color: "white",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "sony-wh-1000xm5",
        name: "Sony WH-1000XM5 Wireless Headphones",
        brand: "Sony",
        category: "headphones",
        price_cents: 34_999,
        color: "silver",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "bose-qc45",
        name: "Bose QuietComfort 45 Headphones",
        brand: "Bose",
        category: "headphones",
        price_cents: 27_900,
        color: "black",
        sizes: &[],
        in_stock: false,
    },
    Product {
        id: "apple-airpods-pro",
        name: "Apple AirPods Pro (2nd generation)",
        brand: "Apple",
        category: "headphones",
        price_cents: 24_900,
        color: "white",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "razer-blackshark-v2",
        name: "Razer BlackShark V2 Gaming Headset",
        brand: "Razer",
        category: "gaming",
        price_cents: 9_999,
        color: "black",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "dell-xps-13",
        name: "Dell XPS 13 Laptop",
        brand: "Dell",
        category: "laptops",
        price_cents: 99_900,
        color: "silver",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "lenovo-ideapad-3",
        name: "Lenovo IdeaPad 3 Laptop",
        brand: "Lenovo",
        category: "laptops",
        price_cents: 54_900,
        color: "gray",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "canon-eos-r50",
        name: "Canon EOS R50 Mirrorless Camera",
        brand: "Canon",
        category: "cameras",
        price_cents: 67_999,
        color: "black",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "samsung-galaxy-s24",
        name: "Samsung Galaxy S24 Smartphone",
        brand: "Samsung",
        category: "smartphones",
        price_cents: 79_999,
        color: "black",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "apple-ipad-air",
        name: "Apple iPad Air Tablet",
        brand: "Apple",
        category: "tablets",
        price_cents: 59_900,
        color: "blue",
        sizes: &[],
        in_stock: true,
    },
    Product {
        id: "nike-pegasus-40",
        name: "Nike Pegasus 40 Running Shoes",
        brand: "Nike",
        category: "shoes",
        price_cents: 12_999,
        color: "blue",
        sizes: &["small", "medium", "large"],
        in_stock: true,
    },
    Product {
        id: "adidas-ultraboost",
        name: "Adidas Ultraboost Light Shoes",
        brand: "Adidas",
        category: "shoes",
        price_cents: 18_000,
        color: "white",
        sizes: &["medium", "large", "xl"],
        in_stock: true,
    },
    Product {
        id: "logitech-mx-master-3s",
        name: "Logitech MX Master 3S Mouse",
        brand: "Logitech",
        category: "office",
        price_cents: 9_999,
        color: "gray",
        sizes: &[],
        in_stock: true,
    },
];

const ORDERS: &[Order] = &[
    Order {
        id: "1001",
        email: "sam@example.com",
        status: "shipped",
        items: &["sony-wh-ch720n"],
        tracking: Some("1Z999AA10123456784"),
        estimated_delivery: Some("in 2 business days"),
    },
    Order {
        id: "1002",
        email: "ali@example.com",
        status: "processing",
        items: &["dell-xps-13", "logitech-mx-master-3s"],
        tracking: None,
        estimated_delivery: Some("ships within 1 business day"),
    },
    Order {
        id: "12345",
        email: "kim@example.com",
        status: "delivered",
        items: &["nike-pegasus-40"],
        tracking: Some("9400111899223197428490"),
        estimated_delivery: None,
    },
    Order {
        id: "ORD-20001",
        email: "jo@example.com",
        status: "cancelled",
        items: &["canon-eos-r50"],
        tracking: None,
        estimated_delivery: None,
    },
];

const POLICIES: &[(&str, &str, &str)] = &[
    (
        "refund",
        "Refund and Return Policy",
        "Unused items can be returned within 30 days of delivery for a full refund. \
         Refunds go back to the original payment method within 5 to 7 business days.",
    ),
    (
        "shipping",
        "Shipping Policy",
        "Standard shipping is free on orders over $50 and takes 3 to 5 business days. \
         Express shipping arrives in 1 to 2 business days for $14.99.",
    ),
    (
        "privacy",
        "Privacy Policy",
        "We only use personal information to process orders and never sell customer data.",
    ),
    (
        "terms",
        "Terms of Service",
        "Orders are subject to availability. Prices may change without notice.",
    ),
    (
        "subscription",
        "Subscription Policy",
        "Subscriptions renew monthly and can be cancelled at any time before the renewal date.",
    ),
];

const FAQS: &[(&str, &str, &str)] = &[
    ("shipping", "How long does shipping take?", "Standard shipping takes 3 to 5 business days."),
    ("shipping", "Do you ship internationally?", "We currently ship to the US and Canada."),
    ("returns", "How do I start a return?", "Reply with your order number and we will email a label."),
    ("payments", "Which payment methods do you accept?", "Visa, Mastercard, Amex and PayPal."),
    ("products", "Are your products covered by warranty?", "Electronics carry a one-year warranty."),
    ("general", "Do you have a physical store?", "Yes, see our store info for hours and address."),
];

/// Shop backend over a fixed catalogue. Counts every upstream call and can
/// inject failures or latency per tool.
#[derive(Default)]
pub struct DemoShop {
    calls: Mutex<HashMap<ShopTool, usize>>,
    failures: Mutex<HashMap<ShopTool, VecDeque<ToolError>>>,
    latency: Mutex<HashMap<ShopTool, Duration>>,
}

impl DemoShop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, tool: ShopTool) -> usize {
        self.calls.lock().get(&tool).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// The next call to `tool` fails with `error`. Queued failures are used in order.
    pub fn fail_next(&self, tool: ShopTool, error: ToolError) {
        self.failures.lock().entry(tool).or_default().push_back(error);
    }

    pub fn set_latency(&self, tool: ShopTool, latency: Duration) {
        self.latency.lock().insert(tool, latency);
    }

    async fn enter(&self, tool: ShopTool) -> Result<(), ToolError> {
        *self.calls.lock().entry(tool).or_insert(0) += 1;
        let latency = self.latency.lock().get(&tool).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.failures.lock().get_mut(&tool).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn product_json(product: &Product) -> Value {
    json!({
        "id": product.id,
        "name": product.name,
        "brand": product.brand,
        "category": product.category,
        "price": format!("${}.{:02}", product.price_cents / 100, product.price_cents % 100),
        "price_cents": product.price_cents,
        "color": product.color,
        "in_stock": product.in_stock,
    })
}

fn stem(word: &str) -> &str {
    word.strip_suffix('s').filter(|stem| stem.len() > 2).unwrap_or(word)
}

fn matches_query(product: &Product, query: &str) -> bool {
    let haystack = format!("{} {} {}", product.name, product.brand, product.category)
        .to_ascii_lowercase();
    query
        .to_ascii_lowercase()
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| word.len() > 1)
        .any(|word| haystack.contains(stem(word)))
}

fn matches_filters(product: &Product, query: &ProductQuery) -> bool {
    let same = |wanted: &Option<String>, actual: &str| {
        wanted.as_ref().map_or(true, |wanted| {
            let wanted = wanted.to_ascii_lowercase();
            actual.to_ascii_lowercase().contains(stem(&wanted))
        })
    };

    same(&query.brand, product.brand)
        && same(&query.category, product.category)
        && same(&query.color, product.color)
        && query.size.as_ref().map_or(true, |size| {
            product.sizes.iter().any(|available| available.eq_ignore_ascii_case(size))
        })
        && query.price_min.map_or(true, |min| product.price_cents >= min * 100)
        && query.price_max.map_or(true, |max| product.price_cents <= max * 100)
}

#[async_trait]
impl ShopBackend for DemoShop {
    async fn search_products(&self, query: &ProductQuery) -> Result<Value, ToolError> {
        self.enter(ShopTool::SearchProducts).await?;
        let products: Vec<Value> = PRODUCTS
            .iter()
            .filter(|product| matches_query(product, &query.query))
            .filter(|product| matches_filters(product, query))
            .take(query.limit as usize)
            .map(product_json)
            .collect();

        Ok(json!({
            "query": query.query,
            "total": products.len(),
            "products": products,
        }))
    }

    async fn product_details(&self, product_id: &str) -> Result<Value, ToolError> {
        self.enter(ShopTool::GetProductDetails).await?;
        let product = PRODUCTS
            .iter()
            .find(|product| product.id == product_id.trim())
            .ok_or_else(|| ToolError::not_found(format!("no product `{product_id}`")))?;

        let mut details = product_json(product);
        details["sizes"] = json!(product.sizes);
        details["warranty"] = json!("1 year");
        Ok(details)
    }

    async fn order_status(&self, order_id: &str, email: Option<&str>) -> Result<Value, ToolError> {
        self.enter(ShopTool::GetOrderStatus).await?;
        let wanted = order_id.trim().trim_start_matches('#').to_ascii_uppercase();
        let order = ORDERS
            .iter()
            .find(|order| order.id == wanted)
            .filter(|order| email.map_or(true, |email| order.email.eq_ignore_ascii_case(email)))
            .ok_or_else(|| ToolError::not_found(format!("no order `{order_id}`")))?;

        Ok(json!({
            "order_id": order.id,
            "status": order.status,
            "items": order.items,
            "tracking_number": order.tracking,
            "estimated_delivery": order.estimated_delivery,
        }))
    }

    async fn policy(&self, policy_type: &str) -> Result<Value, ToolError> {
        self.enter(ShopTool::GetPolicy).await?;
        let (kind, title, body) = POLICIES
            .iter()
            .find(|(kind, _, _)| *kind == policy_type)
            .ok_or_else(|| ToolError::not_found(format!("no {policy_type} policy published")))?;

        Ok(json!({"policy_type": kind, "title": title, "body": body}))
    }

    async fn store_info(&self) -> Result<Value, ToolError> {
        self.enter(ShopTool::GetStoreInfo).await?;
        Ok(json!({
            "name": "Clerk Demo Store",
            "hours": "Mon-Sat 9am-7pm, Sun 11am-5pm",
            "address": "100 Market Street, Springfield",
        }))
    }

    async fn contact_info(&self) -> Result<Value, ToolError> {
        self.enter(ShopTool::GetContactInfo).await?;
        Ok(json!({
            "email": "support@clerk-demo.example",
            "phone": "+1 555 0100",
            "hours": "Mon-Fri 8am-8pm",
        }))
    }

    async fn faq(&self, category: &str, query: Option<&str>) -> Result<Value, ToolError> {
        self.enter(ShopTool::GetFaq).await?;
        let query = query.map(str::to_ascii_lowercase);
        let entries: Vec<Value> = FAQS
            .iter()
            .filter(|(faq_category, _, _)| *faq_category == category)
            .filter(|(_, question, answer)| {
                query.as_ref().map_or(true, |query| {
                    let text = format!("{question} {answer}").to_ascii_lowercase();
                    query.split_whitespace().any(|word| word.len() > 3 && text.contains(word))
                })
            })
            .map(|(_, question, answer)| json!({"question": question, "answer": answer}))
            .collect();

        Ok(json!({"category": category, "entries": entries}))
    }
}
