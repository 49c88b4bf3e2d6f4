use gym_bridge::{
    model::{ModelInterpreter, QTableModel},
    server::{CommandServer, ServerConfig},
};
use serde_json::Value;

/// Observations are expected to carry their table row as `{"state": n}`
fn state_index(observation: &Value) -> usize {
    observation["state"].as_u64().unwrap_or(0) as usize
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let model = QTableModel::new(state_index as fn(&Value) -> usize);
    let mut interpreter = ModelInterpreter::new(model);
    let server = CommandServer::bind("127.0.0.1:9998", ServerConfig::default()).unwrap();
    let outcome = server.serve(&mut interpreter).unwrap();
    log::info!("model server stopped: {outcome:?}");
}
