pub mod admin;
pub mod resync;

use crate::{Data, Error};

pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        resync::resync(),
        admin::escalation(),
        admin::shutdown(),
    ]
}
