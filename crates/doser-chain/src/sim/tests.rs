use core::cell::Cell;

use doser_icd::{
    Frame, LastNodeCommand, ModuleRecord, NewModuleCommand, NewModuleResponse,
    Payload, RestartCommand, SetFlowRateCommand,
};
use doser_pool::{DoserPool, PoolConfig};
use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Timer};

use super::*;
use crate::config::ControllerConfig;
use crate::controller::{enumerate, ChainLayout, EnumerationError};
use crate::BusBackend;

fn specs() -> [SimModuleSpec; 3] {
    [
        SimModuleSpec { num_dosers: 2, max_flow_rate: 60 },
        SimModuleSpec { num_dosers: 1, max_flow_rate: 30 },
        SimModuleSpec { num_dosers: 3, max_flow_rate: 100 },
    ]
}

fn module_config() -> ModuleConfig {
    ModuleConfig {
        retry_max: 100,
        response_timeout: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(40),
        blink_period: Duration::from_millis(5),
        ..Default::default()
    }
}

fn controller_config() -> ControllerConfig {
    ControllerConfig { idle_timeout: Some(Duration::from_secs(2)) }
}

async fn discover(chain: &SimChain) -> ChainLayout {
    let found = select(
        enumerate(&chain.controller(), &controller_config()),
        chain.run_modules(module_config()),
    )
    .await;
    match found {
        Either::First(layout) => layout.expect("enumeration failed"),
        Either::Second(()) => unreachable!("modules never stop"),
    }
}

#[futures_test::test]
async fn addresses_are_contiguous_in_chain_order() {
    let chain = SimChain::new(&specs());
    let layout = discover(&chain).await;

    assert_eq!(
        layout.modules(),
        &[
            ModuleRecord { base_address: 0, num_dosers: 2, max_flow_rate: 60 },
            ModuleRecord { base_address: 2, num_dosers: 1, max_flow_rate: 30 },
            ModuleRecord { base_address: 3, num_dosers: 3, max_flow_rate: 100 },
        ]
    );
    assert_eq!(layout.capabilities(), [60, 60, 30, 100, 100, 100]);
    assert_eq!(layout.len(), 6);
    assert_eq!(layout.module_of(4).map(|m| m.base_address), Some(3));

    assert_eq!(chain.base_address(0), Some(0));
    assert_eq!(chain.base_address(1), Some(2));
    assert_eq!(chain.base_address(2), Some(3));
}

#[futures_test::test]
async fn only_the_last_module_terminates() {
    let chain = SimChain::new(&specs());
    discover(&chain).await;

    assert_eq!(chain.role(0), Some(ChainRole::Forwarding));
    assert_eq!(chain.role(1), Some(ChainRole::Forwarding));
    assert_eq!(chain.role(2), Some(ChainRole::Terminal));
    assert_eq!(
        (0..chain.len()).filter(|&i| chain.terminated(i)).count(),
        1
    );
    assert!(chain.terminated(2));
    assert!((0..chain.len()).all(|i| chain.powered(i)));
}

#[futures_test::test]
async fn single_module_chain() {
    let chain =
        SimChain::new(&[SimModuleSpec { num_dosers: 4, max_flow_rate: 60 }]);
    let layout = discover(&chain).await;

    assert_eq!(layout.capabilities(), [60; 4]);
    assert_eq!(chain.role(0), Some(ChainRole::Terminal));
    assert!(chain.terminated(0));
}

#[futures_test::test]
async fn flow_commands_reach_the_owning_pump() {
    let chain = SimChain::new(&specs());
    let pool: DoserPool<CriticalSectionRawMutex, _> = DoserPool::new(
        BusBackend::<CriticalSectionRawMutex, _>::new(
            chain.controller(),
            controller_config(),
        ),
        PoolConfig { parallel_max: 2 },
    );

    let test = async {
        assert_eq!(pool.connect().await, Ok(6));

        let mut doser = pool.lend(3).unwrap();
        doser.on(50).await.unwrap();
        Timer::after_millis(5).await;
        assert_eq!(chain.flow_rate(2, 0), 50);
        assert_eq!(chain.flow_rate(2, 1), 0);
        assert_eq!(chain.flow_rate(1, 0), 0);

        let mut clamped = pool.lend(1).unwrap();
        clamped.on(100).await.unwrap();
        Timer::after_millis(5).await;
        assert_eq!(chain.flow_rate(0, 1), 60);

        drop(doser);
        clamped.off().unwrap();
        Timer::after_millis(5).await;
        assert_eq!(chain.flow_rate(2, 0), 0);
        assert_eq!(chain.flow_rate(0, 1), 0);
    };
    match select(test, chain.run_modules(module_config())).await {
        Either::First(()) => {}
        Either::Second(()) => unreachable!("modules never stop"),
    }
}

#[futures_test::test]
async fn unknown_frames_are_ignored() {
    let chain = SimChain::new(&specs());
    let controller = chain.controller();

    let test = async {
        enumerate(&controller, &controller_config()).await.unwrap();

        controller.try_send(&Frame::new(0x42, &[1, 2, 3]).unwrap()).unwrap();
        // Too short to carry a flow rate.
        controller.try_send(&Frame::new(0x07, &[0, 0]).unwrap()).unwrap();
        controller
            .try_send(&SetFlowRateCommand { address: 0, flow_rate: 20 }.to_frame())
            .unwrap();
        Timer::after_millis(5).await;

        assert_eq!(chain.flow_rate(0, 0), 20);
        assert!(chain.fault(0).is_none());
    };
    select(test, chain.run_modules(module_config())).await;
}

#[futures_test::test]
async fn restart_stops_pumps_and_reenumerates() {
    let chain = SimChain::new(&specs());
    let controller = chain.controller();

    let test = async {
        let first = enumerate(&controller, &controller_config()).await.unwrap();
        controller
            .try_send(&SetFlowRateCommand { address: 5, flow_rate: 80 }.to_frame())
            .unwrap();
        Timer::after_millis(5).await;
        assert_eq!(chain.flow_rate(2, 2), 80);

        let second = enumerate(&controller, &controller_config()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(chain.flow_rate(2, 2), 0);
        assert!((0..chain.len()).all(|i| chain.boots(i) == 2));
        assert!(chain.terminated(2));
        assert!(!chain.terminated(0));
    };
    select(test, chain.run_modules(module_config())).await;
}

#[futures_test::test]
async fn unanswered_registration_blinks_fault() {
    let chain =
        SimChain::new(&[SimModuleSpec { num_dosers: 1, max_flow_rate: 60 }]);
    let config = ModuleConfig {
        retry_max: 3,
        response_timeout: Duration::from_millis(5),
        ..module_config()
    };

    select(Timer::after_millis(100), chain.run_modules(config)).await;

    assert_eq!(chain.fault(0), Some(FaultCode::Registration));
    assert_eq!(chain.base_address(0), None);
    assert_eq!(chain.role(0), None);
}

#[futures_test::test]
async fn serve_resets_after_restart() {
    let chain =
        SimChain::new(&[SimModuleSpec { num_dosers: 2, max_flow_rate: 60 }]);
    let controller = chain.controller();
    // An answer left over from before the reset must not be taken.
    chain.inboxes[1]
        .try_send(NewModuleResponse { base_address: 7 }.to_frame())
        .unwrap();

    let mut pumps = chain.pumps(0);
    let node = chain.node(0, module_config(), &mut pumps);
    let test = async {
        let layout = enumerate(&controller, &controller_config()).await.unwrap();
        assert_eq!(layout.capabilities(), [60, 60]);

        controller
            .try_send(&SetFlowRateCommand { address: 1, flow_rate: 30 }.to_frame())
            .unwrap();
        Timer::after_millis(5).await;
        assert_eq!(chain.flow_rate(0, 1), 30);

        controller.try_send(&RestartCommand.to_frame()).unwrap();
    };
    let (reset, ()) = join(node.serve(|| "reset"), test).await;

    assert_eq!(reset, "reset");
    assert_eq!(chain.flow_rate(0, 1), 0);
    assert!(!chain.powers_next(0));
    assert!(chain.fault(0).is_none());
}

#[futures_test::test]
async fn serve_blinks_fault_instead_of_resetting() {
    let chain =
        SimChain::new(&[SimModuleSpec { num_dosers: 1, max_flow_rate: 60 }]);
    let config = ModuleConfig {
        retry_max: 2,
        response_timeout: Duration::from_millis(5),
        ..module_config()
    };
    let resets = Cell::new(0);

    let mut pumps = chain.pumps(0);
    let node = chain.node(0, config, &mut pumps);
    select(
        node.serve(|| resets.set(resets.get() + 1)),
        Timer::after_millis(100),
    )
    .await;

    assert_eq!(chain.fault(0), Some(FaultCode::Registration));
    assert_eq!(resets.get(), 0);
}

#[futures_test::test]
async fn unsent_last_node_faults_the_terminal_module() {
    let chain = SimChain::new(&specs()[..2]);
    chain.refuse_frames(1, LastNodeCommand::ID);
    let config =
        ControllerConfig { idle_timeout: Some(Duration::from_millis(200)) };

    let found = select(
        enumerate(&chain.controller(), &config),
        chain.run_modules(module_config()),
    )
    .await;

    assert!(matches!(found, Either::First(Err(EnumerationError::Timeout))));
    assert_eq!(chain.refusals(1), 1);
    assert_eq!(chain.fault(1), Some(FaultCode::Command));
    assert_eq!(chain.fault(0), None);
    assert_eq!(chain.flow_rate(1, 0), 0);
    assert!(!chain.powers_next(1));
    assert!(chain.powers_next(0));
}

#[futures_test::test]
async fn broken_filter_faults_before_registering() {
    let chain = SimChain::new(&specs());
    chain.break_filter(0);

    select(Timer::after_millis(50), chain.run_modules(module_config())).await;

    assert_eq!(chain.fault(0), Some(FaultCode::BusConfig));
    assert_eq!(chain.base_address(0), None);
    assert!(!chain.powers_next(0));
    assert!(!chain.powered(1));
    assert!((0..2).all(|channel| chain.flow_rate(0, channel) == 0));
}

#[futures_test::test]
async fn unsent_registration_uses_up_attempts() {
    let chain =
        SimChain::new(&[SimModuleSpec { num_dosers: 1, max_flow_rate: 60 }]);
    chain.refuse_frames(0, NewModuleCommand::ID);
    let config = ModuleConfig { retry_max: 3, ..module_config() };

    let found = select(
        enumerate(&chain.controller(), &controller_config()),
        async {
            select(Timer::after_millis(50), chain.run_modules(config)).await;
        },
    )
    .await;

    // Each attempt failed at once, well before a response window expired.
    assert!(matches!(found, Either::Second(())));
    assert_eq!(chain.refusals(0), 3);
    assert_eq!(chain.fault(0), Some(FaultCode::Registration));
    assert_eq!(chain.base_address(0), None);
    assert!(!chain.powers_next(0));
    assert_eq!(chain.flow_rate(0, 0), 0);
}
