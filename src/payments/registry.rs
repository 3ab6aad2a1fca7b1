use crate::payments::provider::GatewayAdapter;
use crate::payments::types::PaymentMethod;
use std::collections::HashMap;
use std::sync::Arc;

/// Configured adapters, one per payment method.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    adapters: HashMap<PaymentMethod, Arc<dyn GatewayAdapter>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under the method it reports, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn GatewayAdapter>) -> &mut Self {
        self.adapters.insert(adapter.method(), adapter);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Option<Arc<dyn GatewayAdapter>> {
        self.adapters.get(&method).cloned()
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        PaymentMethod::ALL
            .into_iter()
            .filter(|m| self.adapters.contains_key(m))
            .collect()
    }
}
