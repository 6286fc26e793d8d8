//! Shop tool catalogue
//!
//! Every tool is a variant of [`ShopTool`] with a static [`ToolSpec`]. Planned
//! calls are validated against that schema and decoded into a typed
//! [`ToolInvocation`] before they reach a [`ShopBackend`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clerk_core::domain::tool::{ConcurrencyGroup, ToolArguments, ToolCall, ToolError};
use clerk_core::errors::PlanValidationError;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShopTool {
    SearchProducts,
    GetProductDetails,
    GetOrderStatus,
    GetPolicy,
    GetStoreInfo,
    GetContactInfo,
    GetFaq,
}

impl ShopTool {
    pub const ALL: [ShopTool; 7] = [
        Self::SearchProducts,
        Self::GetProductDetails,
        Self::GetOrderStatus,
        Self::GetPolicy,
        Self::GetStoreInfo,
        Self::GetContactInfo,
        Self::GetFaq,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchProducts => "search_products",
            Self::GetProductDetails => "get_product_details",
            Self::GetOrderStatus => "get_order_status",
            Self::GetPolicy => "get_policy",
            Self::GetStoreInfo => "get_store_info",
            Self::GetContactInfo => "get_contact_info",
            Self::GetFaq => "get_faq",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name.trim())
    }

    pub fn spec(&self) -> ToolSpec {
        match self {
            Self::SearchProducts => ToolSpec {
                tool: *self,
                description: "Search the product catalogue. Prices are whole dollars.",
                args: SEARCH_PRODUCTS_ARGS,
                concurrency: Concurrency::Serial("catalog"),
                rate_limit_per_minute: 120,
                cache_ttl_secs: 1_800,
            },
            Self::GetProductDetails => ToolSpec {
                tool: *self,
                description: "Full details for one product id returned by search_products.",
                args: PRODUCT_DETAILS_ARGS,
                concurrency: Concurrency::Serial("catalog"),
                rate_limit_per_minute: 60,
                cache_ttl_secs: 3_600,
            },
            Self::GetOrderStatus => ToolSpec {
                tool: *self,
                description: "Status, items and tracking for an order number.",
                args: ORDER_STATUS_ARGS,
                concurrency: Concurrency::Serial("orders"),
                rate_limit_per_minute: 30,
                cache_ttl_secs: 300,
            },
            Self::GetPolicy => ToolSpec {
                tool: *self,
                description: "Store policy text (refunds and returns, shipping, privacy, ...).",
                args: POLICY_ARGS,
                concurrency: Concurrency::Parallel,
                rate_limit_per_minute: 60,
                cache_ttl_secs: 86_400,
            },
            Self::GetStoreInfo => ToolSpec {
                tool: *self,
                description: "Store name, opening hours and address.",
                args: &[],
                concurrency: Concurrency::Parallel,
                rate_limit_per_minute: 60,
                cache_ttl_secs: 86_400,
            },
            Self::GetContactInfo => ToolSpec {
                tool: *self,
                description: "Customer support email, phone and hours.",
                args: &[],
                concurrency: Concurrency::Parallel,
                rate_limit_per_minute: 30,
                cache_ttl_secs: 86_400,
            },
            Self::GetFaq => ToolSpec {
                tool: *self,
                description: "Frequently asked questions for a category.",
                args: FAQ_ARGS,
                concurrency: Concurrency::Parallel,
                rate_limit_per_minute: 60,
                cache_ttl_secs: 3_600,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Text,
    Integer { min: i64, max: Option<i64> },
    /// Lowercase choice; `aliases` map accepted spellings onto a value.
    Choice { values: &'static [&'static str], aliases: &'static [(&'static str, &'static str)] },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Concurrency {
    Parallel,
    Serial(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToolSpec {
    pub tool: ShopTool,
    pub description: &'static str,
    pub args: &'static [ArgSpec],
    pub concurrency: Concurrency,
    pub rate_limit_per_minute: u32,
    pub cache_ttl_secs: u64,
}

impl ToolSpec {
    pub fn name(&self) -> &'static str {
        self.tool.name()
    }

    pub fn arg(&self, name: &str) -> Option<&'static ArgSpec> {
        self.args.iter().find(|arg| arg.name == name)
    }

    pub fn concurrency_group(&self) -> ConcurrencyGroup {
        match self.concurrency {
            Concurrency::Parallel => ConcurrencyGroup::Parallel,
            Concurrency::Serial(group) => ConcurrencyGroup::serial(group),
        }
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }

    pub fn schema_json(&self) -> Value {
        let mut properties = Map::new();
        for arg in self.args {
            let mut property = match arg.kind {
                ArgKind::Text => json!({"type": "string"}),
                ArgKind::Integer { min, max } => {
                    let mut schema = json!({"type": "integer", "minimum": min});
                    if let Some(max) = max {
                        schema["maximum"] = json!(max);
                    }
                    schema
                }
                ArgKind::Choice { values, .. } => json!({"type": "string", "enum": values}),
            };
            property["description"] = json!(arg.description);
            properties.insert(arg.name.to_string(), property);
        }
        let required: Vec<&str> =
            self.args.iter().filter(|arg| arg.required).map(|arg| arg.name).collect();

        json!({
            "name": self.name(),
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            },
        })
    }
}

const SEARCH_PRODUCTS_ARGS: &[ArgSpec] = &[
    ArgSpec {
        name: "query",
        kind: ArgKind::Text,
        required: true,
        description: "Product words, e.g. `headphones`",
    },
    ArgSpec {
        name: "limit",
        kind: ArgKind::Integer { min: 1, max: Some(50) },
        required: false,
        description: "Maximum results, default 10",
    },
    ArgSpec { name: "category", kind: ArgKind::Text, required: false, description: "Category" },
    ArgSpec { name: "brand", kind: ArgKind::Text, required: false, description: "Brand name" },
    ArgSpec { name: "color", kind: ArgKind::Text, required: false, description: "Color" },
    ArgSpec { name: "size", kind: ArgKind::Text, required: false, description: "Size" },
    ArgSpec {
        name: "price_min",
        kind: ArgKind::Integer { min: 0, max: None },
        required: false,
        description: "Lowest price in whole dollars, no currency symbol",
    },
    ArgSpec {
        name: "price_max",
        kind: ArgKind::Integer { min: 0, max: None },
        required: false,
        description: "Highest price in whole dollars, no currency symbol",
    },
];

const PRODUCT_DETAILS_ARGS: &[ArgSpec] = &[ArgSpec {
    name: "product_id",
    kind: ArgKind::Text,
    required: true,
    description: "Product id from search results",
}];

const ORDER_STATUS_ARGS: &[ArgSpec] = &[
    ArgSpec {
        name: "order_id",
        kind: ArgKind::Text,
        required: true,
        description: "Order number without `#`",
    },
    ArgSpec {
        name: "email",
        kind: ArgKind::Text,
        required: false,
        description: "Email used for the order",
    },
];

pub const POLICY_TYPES: &[&str] =
    &["refund", "shipping", "privacy", "terms", "subscription", "legal"];

const POLICY_ARGS: &[ArgSpec] = &[ArgSpec {
    name: "policy_type",
    kind: ArgKind::Choice {
        values: POLICY_TYPES,
        aliases: &[("return", "refund"), ("returns", "refund"), ("refunds", "refund")],
    },
    required: false,
    description: "Policy to fetch, default refund",
}];

pub const FAQ_CATEGORIES: &[&str] = &["shipping", "returns", "payments", "products", "general"];

const FAQ_ARGS: &[ArgSpec] = &[
    ArgSpec {
        name: "category",
        kind: ArgKind::Choice {
            values: FAQ_CATEGORIES,
            aliases: &[("return", "returns"), ("payment", "payments"), ("product", "products")],
        },
        required: true,
        description: "FAQ category",
    },
    ArgSpec { name: "query", kind: ArgKind::Text, required: false, description: "Question" },
];

/// Validated search filters. Prices are whole dollars.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProductQuery {
    pub query: String,
    pub limit: u32,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
}

/// A planned call decoded into its typed form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolInvocation {
    SearchProducts(ProductQuery),
    GetProductDetails { product_id: String },
    GetOrderStatus { order_id: String, email: Option<String> },
    GetPolicy { policy_type: String },
    GetStoreInfo,
    GetContactInfo,
    GetFaq { category: String, query: Option<String> },
}

impl ToolInvocation {
    pub fn decode(tool: ShopTool, arguments: &ToolArguments) -> Result<Self, ToolError> {
        let text = |name: &str| arguments.get(name).and_then(Value::as_str).map(str::to_string);
        let required = |name: &str| {
            text(name).ok_or_else(|| {
                ToolError::validation(format!("{} requires `{name}`", tool.name()))
            })
        };
        let integer = |name: &str| arguments.get(name).and_then(Value::as_i64);

        let invocation = match tool {
            ShopTool::SearchProducts => Self::SearchProducts(ProductQuery {
                query: required("query")?,
                limit: integer("limit").and_then(|limit| u32::try_from(limit).ok()).unwrap_or(10),
                category: text("category"),
                brand: text("brand"),
                color: text("color"),
                size: text("size"),
                price_min: integer("price_min"),
                price_max: integer("price_max"),
            }),
            ShopTool::GetProductDetails => {
                Self::GetProductDetails { product_id: required("product_id")? }
            }
            ShopTool::GetOrderStatus => {
                Self::GetOrderStatus { order_id: required("order_id")?, email: text("email") }
            }
            ShopTool::GetPolicy => Self::GetPolicy {
                policy_type: text("policy_type").unwrap_or_else(|| "refund".to_string()),
            },
            ShopTool::GetStoreInfo => Self::GetStoreInfo,
            ShopTool::GetContactInfo => Self::GetContactInfo,
            ShopTool::GetFaq => {
                Self::GetFaq { category: required("category")?, query: text("query") }
            }
        };
        Ok(invocation)
    }
}

/// The e-commerce platform as seen by the tools.
///
/// Failures must use [`ToolError::rate_limited`] when the upstream throttled
/// the request so the executor can honour its retry hint.
#[async_trait]
pub trait ShopBackend: Send + Sync {
    async fn search_products(&self, query: &ProductQuery) -> Result<Value, ToolError>;
    async fn product_details(&self, product_id: &str) -> Result<Value, ToolError>;
    async fn order_status(&self, order_id: &str, email: Option<&str>) -> Result<Value, ToolError>;
    async fn policy(&self, policy_type: &str) -> Result<Value, ToolError>;
    async fn store_info(&self) -> Result<Value, ToolError>;
    async fn contact_info(&self) -> Result<Value, ToolError>;
    async fn faq(&self, category: &str, query: Option<&str>) -> Result<Value, ToolError>;
}

pub struct ToolRegistry {
    tools: HashMap<&'static str, ShopTool>,
    backend: Arc<dyn ShopBackend>,
}

impl ToolRegistry {
    pub fn new(backend: Arc<dyn ShopBackend>) -> Self {
        Self { tools: HashMap::new(), backend }
    }

    /// Registry with the full shop catalogue.
    pub fn shop(backend: Arc<dyn ShopBackend>) -> Self {
        let mut registry = Self::new(backend);
        for tool in ShopTool::ALL {
            registry.register(tool);
        }
        registry
    }

    pub fn register(&mut self, tool: ShopTool) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<ShopTool> {
        self.tools.get(name.trim()).copied()
    }

    pub fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.get(name).map(|tool| tool.spec())
    }

    /// Registered specs in catalogue order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        ShopTool::ALL
            .into_iter()
            .filter(|tool| self.tools.contains_key(tool.name()))
            .map(|tool| tool.spec())
            .collect()
    }

    pub fn schema_json(&self) -> Value {
        Value::Array(self.specs().iter().map(ToolSpec::schema_json).collect())
    }

    /// Checks a planned call against the catalogue and returns it with
    /// normalized arguments and the tool's declared concurrency group.
    pub fn validate_call(&self, call: &ToolCall) -> Result<ToolCall, PlanValidationError> {
        let spec = self
            .spec(&call.tool_name)
            .ok_or_else(|| PlanValidationError::UnknownTool { tool: call.tool_name.clone() })?;

        let mut arguments = ToolArguments::new();
        for (key, value) in &call.arguments {
            let arg = spec.arg(key).ok_or_else(|| PlanValidationError::UnknownArgument {
                tool: spec.name().to_string(),
                argument: key.clone(),
            })?;
            if value.is_null() {
                continue;
            }
            let normalized = normalize_argument(arg, value).map_err(|reason| {
                PlanValidationError::InvalidArgument {
                    tool: spec.name().to_string(),
                    argument: key.clone(),
                    reason,
                }
            })?;
            arguments.insert(key.clone(), normalized);
        }

        if let Some(missing) =
            spec.args.iter().find(|arg| arg.required && !arguments.contains_key(arg.name))
        {
            return Err(PlanValidationError::MissingArgument {
                tool: spec.name().to_string(),
                argument: missing.name.to_string(),
            });
        }

        Ok(ToolCall {
            tool_name: spec.name().to_string(),
            arguments,
            concurrency_group: spec.concurrency_group(),
            depends_on: call.depends_on.clone(),
        })
    }

    /// Dispatches a validated call to the backend.
    pub async fn invoke(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let tool = self
            .get(&call.tool_name)
            .ok_or_else(|| ToolError::not_found(format!("unknown tool `{}`", call.tool_name)))?;
        let backend = self.backend.as_ref();

        match ToolInvocation::decode(tool, &call.arguments)? {
            ToolInvocation::SearchProducts(query) => backend.search_products(&query).await,
            ToolInvocation::GetProductDetails { product_id } => {
                backend.product_details(&product_id).await
            }
            ToolInvocation::GetOrderStatus { order_id, email } => {
                backend.order_status(&order_id, email.as_deref()).await
            }
            ToolInvocation::GetPolicy { policy_type } => backend.policy(&policy_type).await,
            ToolInvocation::GetStoreInfo => backend.store_info().await,
            ToolInvocation::GetContactInfo => backend.contact_info().await,
            ToolInvocation::GetFaq { category, query } => {
                backend.faq(&category, query.as_deref()).await
            }
        }
    }
}

fn normalize_argument(arg: &ArgSpec, value: &Value) -> Result<Value, String> {
    match arg.kind {
        ArgKind::Text => {
            let text = value.as_str().ok_or_else(|| "expected a string".to_string())?.trim();
            if text.is_empty() {
                return Err("must not be empty".to_string());
            }
            Ok(Value::String(text.to_string()))
        }
        ArgKind::Integer { min, max } => {
            let number = match value {
                Value::Number(number) => number
                    .as_i64()
                    .or_else(|| number.as_f64().filter(|float| float.fract() == 0.0).map(|f| f as i64)),
                _ => None,
            }
            .ok_or_else(|| format!("expected an integer, got {value}"))?;

            if number < min || max.is_some_and(|max| number > max) {
                let upper = max.map_or_else(String::new, |max| max.to_string());
                return Err(format!("must be in range {min}..={upper}"));
            }
            Ok(Value::from(number))
        }
        ArgKind::Choice { values, aliases } => {
            let raw = value.as_str().ok_or_else(|| "expected a string".to_string())?;
            let lowered = raw.trim().to_ascii_lowercase();
            let resolved = aliases
                .iter()
                .find(|(alias, _)| *alias == lowered)
                .map(|(_, target)| target.to_string())
                .unwrap_or(lowered);
            if values.contains(&resolved.as_str()) {
                Ok(Value::String(resolved))
            } else {
                Err(format!("`{raw}` is not one of {}", values.join("|")))
            }
        }
    }
}
