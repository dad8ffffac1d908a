// External crates
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Process-wide component health registry backing the `/health` endpoint.
/// Components report in by name; the snapshot is healthy only when every
/// registered component is.
#[derive(Debug, Default)]
pub struct Health {
    components: RwLock<BTreeMap<String, bool>>,
}

impl Health {
    pub fn set(&self, component: &str, healthy: bool) {
        if let Ok(mut components) = self.components.write() {
            components.insert(component.to_string(), healthy);
        }
    }

    pub fn healthy(&self) -> bool {
        match self.components.read() {
            Ok(components) => components.values().all(|ok| *ok),
            Err(_) => false,
        }
    }

    pub fn snapshot(&self) -> (bool, serde_json::Value) {
        let components = match self.components.read() {
            Ok(components) => components.clone(),
            Err(_) => return (false, serde_json::json!({"status": "unknown"})),
        };
        let healthy = components.values().all(|ok| *ok);
        let detail: serde_json::Map<String, serde_json::Value> = components
            .into_iter()
            .map(|(name, ok)| {
                (
                    name,
                    serde_json::Value::String(if ok { "up" } else { "down" }.to_string()),
                )
            })
            .collect();
        (
            healthy,
            serde_json::json!({
                "status": if healthy { "healthy" } else { "unhealthy" },
                "components": detail,
            }),
        )
    }
}
