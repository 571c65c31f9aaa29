//! Seamless travel: two-hop world swap preserving nominated entities

mod common;

use common::{RecordingScript, SharedCounters, SharedGameEvents, TestGame};
use std::cell::RefCell;
use std::rc::Rc;
use strata_engine::entity::{spawn_entity, EntityId};
use strata_engine::world::SpawnParams;
use strata_engine::{Engine, EntityClass, EntityRef, LocalPlayer};

struct TravelFixture {
    engine: Engine,
    events: SharedGameEvents,
    travel_list: Rc<RefCell<Vec<EntityId>>>,
    pc: EntityRef,
    pc_counters: SharedCounters,
    pri: EntityRef,
}

/// Listen server on DM-A with a local player controller and a
/// replication-info entity nominated for preservation by the game
fn make_travel_fixture() -> TravelFixture {
    let mut engine = common::make_engine(0);
    let events: SharedGameEvents = Default::default();
    let travel_list: Rc<RefCell<Vec<EntityId>>> = Default::default();
    {
        let factory_events = events.clone();
        let factory_list = travel_list.clone();
        engine.ctx.register_game(
            "MyGame.Arena",
            Rc::new(move || {
                let mut game = TestGame::new(factory_events.clone());
                game.travel_list = factory_list.clone();
                Box::new(game)
            }),
        );
    }
    engine
        .load_map("DM-A?Listen?game=MyGame.Arena")
        .expect("load_map failed");

    let pc = engine
        .world
        .spawn_player_controller(&mut engine.ctx, 0x01)
        .expect("controller spawn failed");
    let pc_counters: SharedCounters = Default::default();
    pc.borrow_mut().script = Some(Box::new(RecordingScript::new(pc_counters.clone())));

    let mut params = SpawnParams::new(EntityClass::new("MyGame.PRI"));
    params.wants_tick = true;
    let pri = spawn_entity(&mut engine.world, &mut engine.ctx, params, 0).expect("pri spawn failed");
    travel_list.borrow_mut().push(pri.borrow().state.id);

    engine.ctx.local_players.push(LocalPlayer {
        controller: Some(pc.clone()),
        ..Default::default()
    });

    TravelFixture {
        engine,
        events,
        travel_list,
        pc,
        pc_counters,
        pri,
    }
}

fn run_to_completion(fixture: &mut TravelFixture) {
    for _ in 0..40 {
        fixture.engine.tick(1.0 / 60.0, &[]);
        if !fixture.engine.travel.is_in_transition() {
            break;
        }
    }
    assert!(!fixture.engine.travel.is_in_transition(), "travel never finished");
}

#[test]
fn test_seamless_travel_preserves_nominated_entities() {
    let mut fixture = make_travel_fixture();
    let time_before = {
        fixture.engine.tick(1.0 / 60.0, &[]);
        fixture.engine.world.info.time_seconds
    };

    fixture
        .engine
        .seamless_travel("DM-B?game=MyGame.Arena", None)
        .expect("travel failed");
    run_to_completion(&mut fixture);

    let world = &fixture.engine.world;
    assert_eq!(world.package_name, "DM-B");

    // Both nominated entities crossed both hops.
    assert!(strata_engine::entity::contains_entity(world, &fixture.pc));
    assert!(strata_engine::entity::contains_entity(world, &fixture.pri));
    assert_eq!(world.controllers.len(), 1);

    // Begin-play did not fire a second time, and the preserved entities
    // were never "removed from world".
    assert_eq!(fixture.pc_counters.borrow().begin_play, 0);
    assert_eq!(fixture.pc_counters.borrow().on_remove_from_world, 0);
    assert!(fixture.pc.borrow().state.begun_play);

    // Both hops notified the local player; only the last is final.
    let notifies = &fixture.engine.ctx.local_players[0].loaded_world_notifies;
    assert_eq!(
        notifies,
        &vec![
            ("Transition".to_string(), false),
            ("DM-B".to_string(), true)
        ]
    );
    let script_notifies = &fixture.pc_counters.borrow().notify_loaded_world;
    assert_eq!(script_notifies.len(), 2);
    assert_eq!(script_notifies[1], ("DM-B".to_string(), true));

    // The destination got a fresh game that saw PostSeamlessTravel.
    assert_eq!(fixture.events.borrow().post_seamless_travel, 1);
    assert_eq!(fixture.events.borrow().init_game_options.len(), 2);

    // Time was not reset by either hop.
    assert!(fixture.engine.world.info.time_seconds >= time_before);

    // The list the game nominated is still what the test set.
    assert_eq!(fixture.travel_list.borrow().len(), 1);
}

#[test]
fn test_travel_to_new_destination_cancels_outstanding() {
    let mut fixture = make_travel_fixture();
    fixture
        .engine
        .seamless_travel("DM-B?game=MyGame.Arena", None)
        .expect("travel failed");
    fixture.engine.tick(1.0 / 60.0, &[]);

    fixture
        .engine
        .seamless_travel("DM-C?game=MyGame.Arena", None)
        .expect("second travel failed");
    run_to_completion(&mut fixture);

    assert_eq!(fixture.engine.world.package_name, "DM-C");
    assert!(strata_engine::entity::contains_entity(
        &fixture.engine.world,
        &fixture.pc
    ));
}

#[test]
fn test_midpoint_pause_holds_transition() {
    let mut fixture = make_travel_fixture();
    fixture
        .engine
        .seamless_travel("DM-B?game=MyGame.Arena", None)
        .expect("travel failed");

    // Pause before the intermediate swap happens.
    fixture
        .engine
        .travel
        .set_pause_at_midpoint(&mut fixture.engine.ctx, true);

    for _ in 0..20 {
        fixture.engine.tick(1.0 / 60.0, &[]);
    }
    // Swapped to the transition map and stayed there.
    assert!(fixture.engine.travel.is_in_transition());
    assert_eq!(fixture.engine.world.package_name, "Transition");

    fixture
        .engine
        .travel
        .set_pause_at_midpoint(&mut fixture.engine.ctx, false);
    run_to_completion(&mut fixture);
    assert_eq!(fixture.engine.world.package_name, "DM-B");
}
