// Depth Relay - local order book mirror for one exchange symbol
// Layer 1: upstream connectors, Layer 2: synchronization, Layer 3: subscribers

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;
