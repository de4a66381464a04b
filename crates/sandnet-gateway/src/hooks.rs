//! Optional request/response hook points.
//!
//! Hooks observe and may rewrite the logical request before it leaves the
//! host, and the response head before it is serialized back to the guest. A
//! hook error turns the exchange into a synthetic 500; the hook's message is
//! logged, never sent to the guest.

use crate::http::head::{RequestHead, ResponseHead};

pub type RequestHook = Box<dyn Fn(&mut RequestHead) -> Result<(), String> + Send + Sync>;
pub type ResponseHook = Box<dyn Fn(&mut ResponseHead) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
}

impl Hooks {
    pub fn run_request(&self, head: &mut RequestHead) -> Result<(), String> {
        match &self.on_request {
            Some(hook) => hook(head),
            None => Ok(()),
        }
    }

    pub fn run_response(&self, head: &mut ResponseHead) -> Result<(), String> {
        match &self.on_response {
            Some(hook) => hook(head),
            None => Ok(()),
        }
    }
}
