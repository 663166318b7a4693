pub mod context;

use sideway::ibverbs::device::{DeviceList, DeviceInfo};

pub fn get_device_list() -> Vec<String> {
    match DeviceList::new() {
        Ok(list) => list.iter()
            .map(|d| d.name())
            .collect(),
        Err(_) => Vec::new(),
    }
}
