//! Drives a full tree of nodes on threads: samples flow to the root,
//! a policy flows back, and every node observes it.

use std::thread;
use std::time::Duration;

use steer_communication::{ProcessCluster, TreeComm};

/// Each node reports its rank upward; roots aggregate by sum. The global
/// root rebroadcasts the total downward and every node must receive it.
#[test]
fn sum_up_broadcast_down() {
    let num_node = 32;
    let builders = TreeComm::new_vector(num_node, 1, 1);
    let cluster = ProcessCluster::new_vector(num_node);
    let expected: f64 = (0..num_node as u64).map(|r| r as f64).sum();

    let threads: Vec<_> = builders
        .into_iter()
        .zip(cluster)
        .map(|(builder, cluster)| {
            thread::spawn(move || {
                let mut comm = builder.build();
                let num_ctl = comm.num_level_controlled();
                let is_root = num_ctl == comm.root_level();

                // Ascend: start from the local contribution, fold in each
                // controlled level's children as they become ready.
                let mut sample = vec![comm.rank() as f64];
                for level in 0..num_ctl {
                    comm.send_up(level, &sample).unwrap();
                    let size = comm.level_size(level).unwrap();
                    let mut gathered = vec![vec![0.0]; size];
                    while !comm.receive_up(level, &mut gathered).unwrap() {
                        thread::sleep(Duration::from_millis(1));
                    }
                    sample = vec![gathered.iter().flatten().sum()];
                }
                if !is_root {
                    comm.send_up(num_ctl, &sample).unwrap();
                }

                // Descend: the root sources the policy, interior nodes relay.
                let mut policy = Vec::new();
                if is_root {
                    policy = sample.clone();
                }
                else {
                    while !comm.receive_down(num_ctl, &mut policy).unwrap() {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                for level in (0..num_ctl).rev() {
                    let size = comm.level_size(level).unwrap();
                    let fan = vec![policy.clone(); size];
                    comm.send_down(level, &fan).unwrap();
                    while !comm.receive_down(level, &mut policy).unwrap() {
                        thread::sleep(Duration::from_millis(1));
                    }
                }

                cluster.barrier();
                policy[0]
            })
        })
        .collect();

    for thread in threads {
        assert_eq!(thread.join().unwrap(), expected);
    }
}
