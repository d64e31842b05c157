mod bridge_process;

pub use bridge_process::BridgeProcess;
