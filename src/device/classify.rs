use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::capability::{Capability, Light, Power};
use super::refresh::Refresher;
use super::{BaseDevice, Device};
use crate::core::Result;

/// Product family derived from the `miIO.info` model string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Product {
    /// `yeelink.light.*`: color bulb with light and power
    Yeelight,
    /// `chuangmi.plug.*`: switchable socket
    PowerPlug,
    /// Anything else, with the reported model
    Unknown(String),
}

impl Product {
    pub fn from_model(model: &str) -> Self {
        if model.starts_with("yeelink.light.") {
            Product::Yeelight
        } else if model.starts_with("chuangmi.plug.") {
            Product::PowerPlug
        } else {
            Product::Unknown(model.to_string())
        }
    }

    pub fn has_light(&self) -> bool {
        matches!(self, Product::Yeelight)
    }

    pub fn has_power(&self) -> bool {
        matches!(self, Product::Yeelight | Product::PowerPlug)
    }
}

/// Turns a provisional device into its specific kind
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, device: Arc<BaseDevice>) -> Result<Arc<dyn Device>>;
}

/// Classifies by querying `miIO.info` and matching the model
pub struct ProductClassifier {
    refresh_interval: Duration,
}

impl ProductClassifier {
    pub fn new(refresh_interval: Duration) -> Self {
        ProductClassifier { refresh_interval }
    }
}

#[async_trait]
impl Classifier for ProductClassifier {
    async fn classify(&self, device: Arc<BaseDevice>) -> Result<Arc<dyn Device>> {
        let info = device.info().await?;
        let product = Product::from_model(&info.model);
        info!("Device {} is a {:?} ({})", device.id(), product, info.model);
        Ok(ClassifiedDevice::new(device, product, self.refresh_interval))
    }
}

/// A device with known product and capabilities.
///
/// While anyone is subscribed, capabilities are polled every refresh
/// interval so state changes made elsewhere are published.
pub struct ClassifiedDevice {
    base: Arc<BaseDevice>,
    product: Product,
    light: Option<Light>,
    power: Option<Power>,
}

impl std::fmt::Debug for ClassifiedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifiedDevice")
            .field("id", &self.base.id())
            .field("product", &self.product)
            .field("light", &self.light.is_some())
            .field("power", &self.power.is_some())
            .finish()
    }
}

impl ClassifiedDevice {
    /// Composes the capabilities of `product` over `base`.
    ///
    /// The shared base stays provisional until the protocol has swapped
    /// the registry entry over to this device.
    pub fn new(base: Arc<BaseDevice>, product: Product, refresh_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ClassifiedDevice>| {
            let events = base.events().clone();
            let light = product
                .has_light()
                .then(|| Light::new(base.outbound().clone(), events.clone()));
            let power = product
                .has_power()
                .then(|| Power::new(base.outbound().clone(), events.clone()));

            let this = this.clone();
            let refresher = Refresher::new(refresh_interval, move || {
                let this = this.clone();
                async move {
                    if let Some(device) = this.upgrade() {
                        device.refresh().await;
                    }
                }
            });
            events.attach_refresher(Arc::new(refresher));

            ClassifiedDevice {
                base,
                product,
                light,
                power,
            }
        })
    }

    pub fn capabilities(&self) -> Vec<&dyn Capability> {
        let mut capabilities: Vec<&dyn Capability> = Vec::new();
        if let Some(light) = &self.light {
            capabilities.push(light);
        }
        if let Some(power) = &self.power {
            capabilities.push(power);
        }
        capabilities
    }

    /// Updates every capability once
    pub async fn refresh(&self) {
        for capability in self.capabilities() {
            if let Err(e) = capability.update().await {
                debug!(
                    "Failed to refresh {} of device {}: {}",
                    capability.name(),
                    self.base.id(),
                    e
                );
            }
        }
    }
}

impl Device for ClassifiedDevice {
    fn base(&self) -> &BaseDevice {
        &self.base
    }

    fn product(&self) -> Product {
        self.product.clone()
    }

    fn light(&self) -> Option<&Light> {
        self.light.as_ref()
    }

    fn power(&self) -> Option<&Power> {
        self.power.as_ref()
    }
}
