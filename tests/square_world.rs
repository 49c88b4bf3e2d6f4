use std::{thread::JoinHandle, time::Duration};

use gym_bridge::{
    algo::{QLearner, QLearnerConfig},
    channel::ChannelConfig,
    env::{EnvClient, Environment, GymEnvInterpreter},
    error::ProtocolError,
    gym::{
        square_world::{json_location_indexer, num_location_states},
        SquareWorld,
    },
    protocol::StepData,
    server::{CommandServer, ServerConfig, SessionOutcome},
};
use serde_json::json;

const SIZE: usize = 6;

type ServerHandle =
    JoinHandle<Result<(SessionOutcome, GymEnvInterpreter<SquareWorld>), ProtocolError>>;

fn connect() -> (EnvClient, ServerHandle) {
    let config = ServerConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let server = CommandServer::bind("127.0.0.1:0", config).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.spawn(GymEnvInterpreter::new(SquareWorld::new(SIZE)));
    let env = EnvClient::connect(addr, &ChannelConfig::default()).unwrap();
    (env, handle)
}

#[test]
fn walking_to_the_goal() {
    let (mut env, handle) = connect();
    assert_eq!(env.action_space(), &["left", "right", "up", "down"]);
    assert_eq!(env.reset().unwrap(), json!({"x": 3, "y": 3}));

    for label in ["right", "up", "right"] {
        assert!(!env.step_label(label).unwrap().end);
    }
    assert_eq!(
        env.step_label("up").unwrap(),
        StepData::new(json!({"x": 5, "y": 5}), 100.0, true)
    );
    assert!(
        env.step_label("up").is_err(),
        "No steps after the episode has ended"
    );

    env.close().unwrap();
    let (outcome, interpreter) = handle.join().unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Killed);
    assert_eq!(interpreter.env().steps(), 4);
}

#[test]
fn training_session() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut env, handle) = connect();

    let mut agent = QLearner::new(
        num_location_states(SIZE),
        env.action_space().len(),
        QLearnerConfig::default(),
        json_location_indexer(SIZE),
    )
    .unwrap();
    let report = agent.train(&mut env, 2000).unwrap();
    assert_eq!(report.total_steps, 2000);
    assert!(report.episodes() > 0);
    assert!(report
        .episode_rewards
        .iter()
        .all(|&r| r == 100.0 || r == -100.0));

    let run = agent.greedy_run(&mut env, 10).unwrap();
    assert!(!run.actions.is_empty() && run.actions.len() <= 10);
    if run.terminal {
        assert!(run.last_reward == 100.0 || run.last_reward == -100.0);
    }

    env.close().unwrap();
    let (outcome, _) = handle.join().unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Killed);
}
