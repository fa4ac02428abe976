//! Drives the full controller/application shared-memory protocol: the
//! rendezvous, steady-state sampling, the name exchange, and shutdown.

use std::thread;
use std::time::{Duration, Instant};

use steer::env::Environment;
use steer::profile::{status, ApplicationInlet, ApplicationIo, ControlMessage, ProfileTable,
                     TABLE_SIZE};
use steer::region::{region_id, REGION_ID_EPOCH};
use steer_shmem::SharedMemory;

const ATTACH: Duration = Duration::from_secs(5);

/// The application half of the protocol, as a library user would write it.
fn run_application(shmkey: String) {
    let ctl_shmem = SharedMemory::attach(&format!("{}-control", shmkey),
                                         ControlMessage::size(), ATTACH).unwrap();
    let msg = unsafe { ControlMessage::from_ptr(ctl_shmem.pointer(), false, ATTACH) };

    // Two ranks across four CPUs.
    msg.set_cpu_rank(0, 0);
    msg.set_cpu_rank(1, 0);
    msg.set_cpu_rank(2, 1);
    msg.set_cpu_rank(3, 1);
    msg.step_to(status::MAP_BEGIN).unwrap();
    msg.step_to(status::MAP_END).unwrap();
    msg.wait_peer(status::MAP_END).unwrap();

    let tables: Vec<SharedMemory> = (0..2)
        .map(|rank| {
            SharedMemory::attach(&format!("{}-sample-{}", shmkey, rank), TABLE_SIZE, ATTACH)
                .unwrap()
        })
        .collect();
    msg.step_to(status::SAMPLE_BEGIN).unwrap();

    let foo = region_id("foo");
    for (rank, shmem) in tables.iter().enumerate() {
        let table = unsafe { ProfileTable::from_ptr(shmem.pointer(), TABLE_SIZE) };
        let skew = rank as f64 * 0.5;
        table.enter(REGION_ID_EPOCH, 0.0 + skew);
        table.enter(foo, 1.0 + skew);
        table.exit(foo, 3.0 + skew);
        table.enter(REGION_ID_EPOCH, 4.0 + skew);
    }

    // Let the controller drain at least once mid-run.
    thread::sleep(Duration::from_millis(50));

    msg.step_to(status::SAMPLE_END).unwrap();
    msg.wait_peer(status::SAMPLE_END).unwrap();

    // Overwrite each table with the name blob:
    // report\0profile\0region...\0\0
    let blob = b"app.report\0bench\0foo\0\0";
    for shmem in &tables {
        unsafe {
            std::ptr::copy_nonoverlapping(blob.as_ptr(), shmem.pointer(), blob.len());
        }
    }
    msg.step_to(status::NAME_BEGIN).unwrap();
    msg.step_to(status::NAME_END).unwrap();
    msg.wait_peer(status::NAME_END).unwrap();
    msg.step_to(status::SHUTDOWN).unwrap();
}

#[test]
fn rendezvous_sampling_names_and_shutdown() {
    let shmkey = format!("/steer-prof-{}", std::process::id());
    let env = Environment {
        shmkey: shmkey.clone(),
        profile_timeout: Duration::from_secs(5),
        ..Environment::default()
    };
    let mut app_io = ApplicationIo::new(&env, 4).unwrap();

    let app = thread::spawn(move || run_application(shmkey));

    let connected = Instant::now();
    app_io.connect().unwrap();

    while !app_io.do_shutdown() {
        app_io.update().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    app_io.update().unwrap();
    let wall = connected.elapsed().as_secs_f64();
    app.join().unwrap();

    // Region accounting: both ranks ran "foo" for two seconds.
    let foo = region_id("foo");
    assert_eq!(app_io.total_region_runtime(foo), 2.0);
    assert_eq!(app_io.total_count(foo), 1);

    // The epoch clock started at the first entry and advanced per rank.
    assert_eq!(app_io.epoch_count(), 2);
    assert_eq!(app_io.last_epoch_runtime(), 4.0);

    // Names arrived through the exchange.
    let names = app_io.region_name_set();
    assert_eq!(names.get(&foo).map(String::as_str), Some("foo"));
    assert_eq!(app_io.report_name(), "app.report");
    assert_eq!(app_io.profile_name(), "bench");

    // Wall-clock accounting is frozen at shutdown, within the polling
    // cadence of this loop.
    let total = app_io.total_app_runtime();
    assert!(total > 0.0);
    assert!(total <= wall + 0.05);
}
