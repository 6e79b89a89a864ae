#![allow(dead_code)]

pub mod datastore;
pub mod gateway;
pub mod speech;
