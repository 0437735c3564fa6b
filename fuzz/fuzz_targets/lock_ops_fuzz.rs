#![no_main]

use libfuzzer_sys::fuzz_target;
use rslock::{Client, Config, LockError, LockManager, LockMode, ResourceType};

const CLIENTS: usize = 2;
const RESOURCES: usize = 4;

// 模型：每个客户端对每个资源的本地引用计数
#[derive(Default, Clone, Copy)]
struct Held {
    shared: u32,
    exclusive: u32,
}

impl Held {
    fn any(&self) -> bool {
        self.shared > 0 || self.exclusive > 0
    }
}

fn other(client: usize) -> usize {
    1 - client
}

fuzz_target!(|data: &[u8]| {
    let node = ResourceType::new(0, "Node");
    let manager = LockManager::new(Config::default(), vec![node.clone()]).unwrap();
    let clients: Vec<Client> = (0..CLIENTS).map(|_| manager.new_client().unwrap()).collect();
    let mut model = [[Held::default(); RESOURCES]; CLIENTS];

    for &byte in data.iter().take(512) {
        let c = (byte & 1) as usize;
        let r = ((byte >> 1) & 3) as usize;
        let id = r as u64;
        let client = &clients[c];
        let mine = model[c][r];
        let theirs = model[other(c)][r];

        match (byte >> 3) % 6 {
            0 => {
                let expected = mine.any() || theirs.exclusive == 0;
                assert_eq!(client.try_shared_lock(&node, id), expected);
                if expected {
                    model[c][r].shared += 1;
                }
            }
            1 => {
                let expected = mine.exclusive > 0 || !theirs.any();
                assert_eq!(client.try_exclusive_lock(&node, id), expected);
                if expected {
                    model[c][r].exclusive += 1;
                }
            }
            2 => {
                let expected = mine.any();
                assert_eq!(client.re_enter_shared(&node, id), expected);
                if expected {
                    model[c][r].shared += 1;
                }
            }
            3 => {
                let expected = mine.exclusive > 0;
                assert_eq!(client.re_enter_exclusive(&node, id), expected);
                if expected {
                    model[c][r].exclusive += 1;
                }
            }
            4 => match client.release_shared(&node, &[id]) {
                Ok(()) => {
                    assert!(mine.shared > 0);
                    model[c][r].shared -= 1;
                }
                Err(LockError::NotHeld { .. }) => assert_eq!(mine.shared, 0),
                Err(err) => panic!("unexpected error: {}", err),
            },
            _ => match client.release_exclusive(&node, &[id]) {
                Ok(()) => {
                    assert!(mine.exclusive > 0);
                    model[c][r].exclusive -= 1;
                }
                Err(LockError::NotHeld { .. }) => assert_eq!(mine.exclusive, 0),
                Err(err) => panic!("unexpected error: {}", err),
            },
        }

        // 不变量检查
        for resource in 0..RESOURCES {
            let held = [model[0][resource], model[1][resource]];
            let installed = manager.lock_of(&node, resource as u64).unwrap();
            assert_eq!(installed.is_some(), held.iter().any(Held::any));

            for (index, state) in held.iter().enumerate() {
                if state.exclusive > 0 {
                    assert!(!held[other(index)].any(), "exclusive lock shared with another client");
                }
                let client = &clients[index];
                assert_eq!(client.holds_lock(&node, resource as u64, LockMode::Shared), state.shared > 0);
                assert_eq!(client.holds_lock(&node, resource as u64, LockMode::Exclusive), state.exclusive > 0);
            }
        }
    }

    for client in &clients {
        client.close();
    }
    assert_eq!(manager.locked_resource_count(), 0);
});
