use std::time::Duration;

use gym_bridge::{
    algo::{QLearner, QLearnerConfig},
    channel::ChannelConfig,
    env::{EnvClient, Environment},
    gym::square_world::{json_location_indexer, num_location_states},
};

const SIZE: usize = 6;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut env = EnvClient::connect_with_retry(
        "127.0.0.1:9999",
        &ChannelConfig::default(),
        Duration::from_secs(20),
    )
    .unwrap();

    let mut agent = QLearner::new(
        num_location_states(SIZE),
        env.action_space().len(),
        QLearnerConfig::default(),
        json_location_indexer(SIZE),
    )
    .unwrap();

    let report = agent.train(&mut env, 2000).unwrap();
    println!(
        "trained {} steps over {} episodes",
        report.total_steps,
        report.episodes()
    );

    let run = agent.greedy_run(&mut env, 10).unwrap();
    println!(
        "greedy run: {:?}, last reward {}, terminal {}",
        run.actions, run.last_reward, run.terminal
    );

    env.close().unwrap();
}
