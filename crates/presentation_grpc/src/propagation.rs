//! W3C trace context propagation over gRPC metadata

use observability::TelemetryHandle;
use opentelemetry::{
    Context,
    propagation::{Extractor, Injector},
};
use tonic::metadata::{KeyRef, MetadataKey, MetadataMap, MetadataValue};

/// Parent context carried by incoming request metadata
pub fn extract_context(telemetry: &TelemetryHandle, metadata: &MetadataMap) -> Context {
    telemetry.extract(&MetadataExtractor(metadata))
}

/// Write `cx` into outgoing request metadata
pub fn inject_context(telemetry: &TelemetryHandle, cx: &Context, metadata: &mut MetadataMap) {
    telemetry.inject(cx, &mut MetadataInjector(metadata));
}

/// Reads ASCII metadata entries; binary entries are ignored
#[derive(Debug)]
pub struct MetadataExtractor<'a>(pub &'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter_map(|key| match key {
                KeyRef::Ascii(key) => Some(key.as_str()),
                KeyRef::Binary(_) => None,
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct MetadataInjector<'a>(pub &'a mut MetadataMap);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = match MetadataKey::from_bytes(key.as_bytes()) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping propagation field with invalid key");
                return;
            },
        };
        match MetadataValue::try_from(value.as_str()) {
            Ok(value) => {
                self.0.insert(key, value);
            },
            Err(e) => tracing::debug!(error = %e, "Skipping propagation field with invalid value"),
        }
    }
}
