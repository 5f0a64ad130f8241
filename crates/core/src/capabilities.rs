// Editor capabilities translated into MCP tool descriptors

use crate::error::{BridgeError, BridgeResult};
use crate::sync::{read, write, FlagGuard};
use crate::transport::PeerClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Parameter type as declared by the editor, reduced to what JSON Schema
/// needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
}

impl ParamType {
    /// Parse a declared type name. Unknown names map to `String`.
    pub fn parse(declared: &str) -> Self {
        match declared.to_ascii_lowercase().as_str() {
            "number" | "int" | "float" | "double" => Self::Number,
            "boolean" | "bool" => Self::Boolean,
            "array" => Self::Array,
            _ => Self::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
        }
    }
}

/// One entry of the editor's `get-tool-details` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilityDescriptor {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default, rename = "parameterSchema")]
    pub parameter_schema: Option<ParameterSchema>,

    #[serde(default, rename = "displayDevelopmentOnly")]
    pub development_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParameterSchema {
    #[serde(default, rename = "Properties")]
    pub properties: Option<Map<String, Value>>,

    #[serde(default, rename = "Required")]
    pub required: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PropertySpec {
    #[serde(default, rename = "Type")]
    kind: Option<String>,

    #[serde(default, rename = "Description")]
    description: Option<String>,

    #[serde(default, rename = "DefaultValue")]
    default_value: Option<Value>,

    #[serde(default, rename = "Enum")]
    allowed: Option<Value>,
}

/// A capability as exposed to MCP clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn from_capability(capability: &CapabilityDescriptor) -> Self {
        let description = capability
            .description
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| format!("Execute editor tool: {}", capability.name));

        Self {
            name: capability.name.clone(),
            description,
            input_schema: translate_schema(capability.parameter_schema.as_ref()),
        }
    }

    /// Whether the tool declares any parameters.
    pub fn has_parameters(&self) -> bool {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|properties| !properties.is_empty())
    }
}

/// Schema for a tool without parameters.
pub fn empty_input_schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false,
    })
}

/// Translate the editor's parameter schema into a JSON Schema object.
pub fn translate_schema(schema: Option<&ParameterSchema>) -> Value {
    let Some(properties) = schema
        .and_then(|s| s.properties.as_ref())
        .filter(|p| !p.is_empty())
    else {
        return empty_input_schema();
    };

    let mut translated = Map::new();
    for (name, raw) in properties {
        translated.insert(name.clone(), translate_property(name, raw));
    }

    let mut input_schema = Map::new();
    input_schema.insert("type".into(), json!("object"));
    input_schema.insert("properties".into(), Value::Object(translated));

    let required = schema
        .and_then(|s| s.required.clone())
        .unwrap_or_default();
    if !required.is_empty() {
        input_schema.insert("required".into(), json!(required));
    }

    Value::Object(input_schema)
}

fn translate_property(name: &str, raw: &Value) -> Value {
    let spec: PropertySpec = serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
        warn!(parameter = name, error = %e, "Unreadable parameter spec, treating as string");
        PropertySpec::default()
    });
    let kind = spec
        .kind
        .as_deref()
        .map(ParamType::parse)
        .unwrap_or(ParamType::String);

    let mut property = Map::new();
    property.insert("type".into(), json!(kind.as_str()));
    property.insert(
        "description".into(),
        json!(spec
            .description
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| format!("Parameter: {name}"))),
    );

    if let Some(default) = spec.default_value.filter(|d| !d.is_null()) {
        if kind == ParamType::Array && default.is_array() {
            property.insert("items".into(), json!({ "type": "string" }));
        }
        property.insert("default".into(), default);
    }

    if let Some(allowed) = spec.allowed.filter(|a| a.as_array().is_some_and(|a| !a.is_empty())) {
        property.insert("enum".into(), allowed);
    }

    Value::Object(property)
}

/// Translated tools in the order the editor announced them.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: Vec<ToolDescriptor>,
    by_name: HashMap<String, usize>,
}

impl ToolSet {
    pub fn new(descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        let mut set = Self::default();
        for descriptor in descriptors {
            match set.by_name.get(&descriptor.name) {
                Some(&index) => set.tools[index] = descriptor,
                None => {
                    set.by_name.insert(descriptor.name.clone(), set.tools.len());
                    set.tools.push(descriptor);
                }
            }
        }
        set
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name).map(|&index| &self.tools[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Extract the descriptor array from a `get-tool-details` result: either a
/// bare array or an object wrapping one under `Tools`.
pub fn parse_tool_details(response: &Value, development: bool) -> BridgeResult<Vec<ToolDescriptor>> {
    let entries = match response {
        Value::Array(entries) => entries,
        Value::Object(object) => match object.get("Tools") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(BridgeError::Protocol(
                    "tool details response has no Tools array".to_string(),
                ))
            }
        },
        _ => {
            return Err(BridgeError::Protocol(
                "tool details response is not an array".to_string(),
            ))
        }
    };

    let mut descriptors = Vec::with_capacity(entries.len());
    for entry in entries {
        let capability: CapabilityDescriptor = match serde_json::from_value(entry.clone()) {
            Ok(capability) => capability,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable capability descriptor");
                continue;
            }
        };
        if capability.name.is_empty() {
            warn!("Skipping capability descriptor without a name");
            continue;
        }
        if capability.development_only.unwrap_or(false) && !development {
            debug!(tool = %capability.name, "Skipping development-only tool");
            continue;
        }
        descriptors.push(ToolDescriptor::from_capability(&capability));
    }
    Ok(descriptors)
}

/// Serves tool lookups from a snapshot that each refresh swaps wholesale.
pub struct CapabilityManager {
    client: Arc<PeerClient>,
    development: bool,
    tools: RwLock<Arc<ToolSet>>,
    refreshing: AtomicBool,
}

impl CapabilityManager {
    pub fn new(client: Arc<PeerClient>, development: bool) -> Self {
        Self {
            client,
            development,
            tools: RwLock::new(Arc::new(ToolSet::default())),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn is_development(&self) -> bool {
        self.development
    }

    /// Fetch and translate the editor's current capability list.
    pub async fn tools_from_peer(&self) -> BridgeResult<Vec<ToolDescriptor>> {
        let response = self.client.fetch_tool_details(self.development).await?;
        parse_tool_details(&response, self.development)
    }

    /// Replace the tool set with the editor's current list.
    ///
    /// Failures never escape: a malformed response installs an empty set,
    /// a failed request keeps the previous one.
    pub async fn initialize_tools(&self) {
        if !self.client.is_connected() {
            debug!("Editor not connected, keeping current tool set");
            return;
        }

        match self.tools_from_peer().await {
            Ok(descriptors) => {
                let set = ToolSet::new(descriptors);
                info!(tool_count = set.len(), "Tool set updated");
                self.install(set);
            }
            Err(e @ BridgeError::Protocol(_)) => {
                error!(error = %e, "Invalid tool details response");
                self.install(ToolSet::default());
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch tool details");
            }
        }
    }

    /// Refresh the tool set. Returns `false` if a refresh was already
    /// running, in which case this call does nothing.
    pub async fn refresh(&self) -> bool {
        let Some(_refreshing) = FlagGuard::acquire(&self.refreshing) else {
            if self.development {
                debug!("Tool refresh already in progress, skipping");
            }
            return false;
        };
        self.initialize_tools().await;
        true
    }

    /// Refresh, then run `notify` if this call performed the refresh.
    pub async fn refresh_and_notify<F, Fut>(&self, notify: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if !self.refresh().await {
            return false;
        }
        notify().await;
        true
    }

    /// Current snapshot. Stays consistent even if a refresh lands meanwhile.
    pub fn snapshot(&self) -> Arc<ToolSet> {
        read(&self.tools).clone()
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.snapshot().iter().cloned().collect()
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.snapshot().get(name).cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.snapshot().get(name).is_some()
    }

    pub fn tool_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Invoke a tool on the editor.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> BridgeResult<Value> {
        let tool = self
            .get_tool(name)
            .ok_or_else(|| BridgeError::UnknownTool(name.to_string()))?;

        let arguments = if !tool.has_parameters() || arguments.is_null() {
            json!({})
        } else {
            arguments
        };

        debug!(tool = name, "Calling editor tool");
        self.client.execute_tool(name, arguments).await
    }

    fn install(&self, set: ToolSet) {
        *write(&self.tools) = Arc::new(set);
    }
}
