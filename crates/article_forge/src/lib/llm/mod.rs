pub mod gateway;
pub mod openai;
pub mod speech;
