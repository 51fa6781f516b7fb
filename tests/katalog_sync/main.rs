mod daemon_flow;
mod readiness_gate;
mod rpc_surface;
