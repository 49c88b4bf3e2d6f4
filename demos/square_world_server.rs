use gym_bridge::{
    env::GymEnvInterpreter,
    gym::SquareWorld,
    server::{CommandServer, ServerConfig},
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let mut interpreter = GymEnvInterpreter::new(SquareWorld::new(6));
    let server = CommandServer::bind("127.0.0.1:9999", ServerConfig::default()).unwrap();
    let outcome = server.serve_once(&mut interpreter).unwrap();
    log::info!("session finished: {outcome:?}");
}
