// =============================================================================
// Inbound surface: REST control plane + WebSocket telemetry
// =============================================================================

pub mod rest;
pub mod ws;
