// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous request/reply between tasks of one CPU.
//!
//! A client calls a server task (one flagged `RPC_SERVER`) and stays in
//! WAIT_SEND until the server replies. The request is "accepted" once the
//! server has received it; only an accepted request can be replied to.
//! Servers pick pending requests by client priority, then arrival.
//!
//! There's no separate message buffer: the single request word lives in the
//! client's `rpc_arg` and the reply is written straight into the client's
//! return registers.

use abi::{ErrorCode, TaskFlags, TaskId, TaskState};

use crate::startup::Kernel;
use crate::task::{Blocking, WaitObj};

impl Kernel {
    /// Finds the most important pending, not yet accepted, request for
    /// `server`.
    fn rpc_pick(&self, server: usize) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.state == TaskState::WaitSend
                    && t.wait
                        == WaitObj::RpcSend {
                            server: server as u16,
                            accepted: false,
                        }
            })
            .min_by_key(|(_, t)| (core::cmp::Reverse(t.prio.0), t.wait_seq))
            .map(|(i, _)| i)
    }

    fn rpc_accept(&mut self, client: usize, server: usize) -> u32 {
        self.tasks[client].wait = WaitObj::RpcSend {
            server: server as u16,
            accepted: true,
        };
        self.tasks[client].rpc_arg
    }

    /// Fails every call outstanding against `server`.
    pub(crate) fn rpc_abort_clients(&mut self, server: usize) {
        self.rpc_abort(server, false);
    }

    /// Fails the calls `server` has received but not answered. Requests it
    /// hasn't taken yet stay queued for its next activation.
    pub(crate) fn rpc_abort_accepted(&mut self, server: usize) {
        self.rpc_abort(server, true);
    }

    fn rpc_abort(&mut self, server: usize, accepted_only: bool) {
        for c in 0..self.tasks.len() {
            let t = &self.tasks[c];
            let hit = match t.wait {
                WaitObj::RpcSend { server: s, accepted } => {
                    usize::from(s) == server && (accepted || !accepted_only)
                }
                _ => false,
            };
            if t.state == TaskState::WaitSend && hit {
                self.task_wake(c, Err(ErrorCode::State));
            }
        }
    }

    /// Sends `arg` to `server` and waits for its reply, which is delivered
    /// as the result value.
    pub fn sys_rpc_call(
        &mut self,
        cpu: usize,
        server: TaskId,
        arg: u32,
        timeout: u64,
    ) -> Result<Blocking<u32>, ErrorCode> {
        let s = self.task_lookup(cpu, server)?;
        if !self.tasks[s].desc.flags.contains(TaskFlags::RPC_SERVER) {
            return Err(ErrorCode::Id);
        }
        if self.task_cpu(s) != cpu {
            return Err(ErrorCode::Core);
        }
        let me = self.caller(cpu);
        if s == me {
            return Err(ErrorCode::Value);
        }
        if timeout == 0 {
            return Err(ErrorCode::Timeout);
        }
        self.tasks[me].rpc_arg = arg;
        self.task_block(
            me,
            TaskState::WaitSend,
            WaitObj::RpcSend {
                server: s as u16,
                accepted: false,
            },
            timeout,
        );
        if self.tasks[s].state == TaskState::WaitRecv {
            let arg = self.rpc_accept(me, s);
            self.task_wake(s, Ok([me as u32, arg]));
        }
        Ok(Blocking::Blocked)
    }

    /// Takes the next request, returning the client and its argument.
    pub fn sys_rpc_recv(
        &mut self,
        cpu: usize,
        timeout: u64,
    ) -> Result<Blocking<(TaskId, u32)>, ErrorCode> {
        let me = self.caller(cpu);
        if !self.tasks[me].desc.flags.contains(TaskFlags::RPC_SERVER) {
            return Err(ErrorCode::Access);
        }
        if let Some(c) = self.rpc_pick(me) {
            let arg = self.rpc_accept(c, me);
            return Ok(Blocking::Done((TaskId::from(c), arg)));
        }
        if timeout == 0 {
            return Err(ErrorCode::Timeout);
        }
        self.task_block(me, TaskState::WaitRecv, WaitObj::RpcRecv, timeout);
        Ok(Blocking::Blocked)
    }

    pub fn sys_rpc_reply(
        &mut self,
        cpu: usize,
        client: TaskId,
        value: u32,
    ) -> Result<(), ErrorCode> {
        let me = self.caller(cpu);
        let c = client.index();
        let Some(t) = self.tasks.get(c) else {
            return Err(ErrorCode::Id);
        };
        let expected = WaitObj::RpcSend {
            server: me as u16,
            accepted: true,
        };
        if t.state != TaskState::WaitSend || t.wait != expected {
            return Err(ErrorCode::State);
        }
        self.task_wake(c, Ok([value, 0]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use abi::INFINITE;

    const APP: &str = r#"
        [[cpu]]
        [[partition]]
        name = "p"
        initial_mode = "normal"
        [[task]]
        name = "server"
        partition = "p"
        priority = 2
        rpc_server = true
        [[task]]
        name = "lo"
        partition = "p"
        priority = 5
        [[task]]
        name = "hi"
        partition = "p"
        priority = 7
        [[task]]
        name = "lo2"
        partition = "p"
        priority = 5
    "#;

    #[test]
    fn server_picks_by_priority_then_arrival() {
        let (mut k, app) = boot(APP);
        let server = app.task("server");
        for (n, arg) in [("lo", 1), ("lo2", 2), ("hi", 3)] {
            run(&mut k, 0, app.task(n));
            assert_eq!(
                k.sys_rpc_call(0, server, arg, INFINITE),
                Ok(Blocking::Blocked)
            );
            k.schedule(0);
        }
        run(&mut k, 0, server);
        let got = k.sys_rpc_recv(0, INFINITE);
        assert_eq!(got, Ok(Blocking::Done((app.task("hi"), 3))));
        let got = k.sys_rpc_recv(0, INFINITE);
        assert_eq!(got, Ok(Blocking::Done((app.task("lo"), 1))));

        // Only accepted requests can be answered.
        assert_eq!(
            k.sys_rpc_reply(0, app.task("lo2"), 0),
            Err(ErrorCode::State)
        );
        k.sys_rpc_reply(0, app.task("lo"), 42).unwrap();
        assert_eq!(result(k.task(app.task("lo")).save().rets()), Ok([42, 0]));
    }

    #[test]
    fn waiting_server_gets_request_immediately() {
        let (mut k, app) = boot(APP);
        let (server, hi) = (app.task("server"), app.task("hi"));
        run(&mut k, 0, server);
        assert_eq!(k.sys_rpc_recv(0, 0), Err(ErrorCode::Timeout));
        assert_eq!(k.sys_rpc_recv(0, INFINITE), Ok(Blocking::Blocked));
        k.schedule(0);
        run(&mut k, 0, hi);
        assert_eq!(k.sys_rpc_call(0, server, 9, INFINITE), Ok(Blocking::Blocked));
        assert_eq!(k.task(server).state(), TaskState::Ready);
        assert_eq!(
            result(k.task(server).save().rets()),
            Ok([hi.index() as u32, 9])
        );
    }

    #[test]
    fn stopping_server_fails_clients() {
        let (mut k, app) = boot(APP);
        let (server, lo, hi) =
            (app.task("server"), app.task("lo"), app.task("hi"));
        run(&mut k, 0, server);
        k.schedule(0);
        run(&mut k, 0, lo);
        assert_eq!(k.sys_rpc_call(0, lo, 1, INFINITE), Err(ErrorCode::Id));
        assert_eq!(k.sys_rpc_call(0, server, 1, INFINITE), Ok(Blocking::Blocked));
        k.schedule(0);
        run(&mut k, 0, hi);
        k.sys_task_terminate_other(0, server).unwrap();
        assert_eq!(k.task(lo).state(), TaskState::Ready);
        assert_eq!(result(k.task(lo).save().rets()), Err(ErrorCode::State));
    }

    #[test]
    fn server_terminating_mid_call_fails_only_accepted_client() {
        let (mut k, app) = boot(APP);
        let (server, lo, hi) =
            (app.task("server"), app.task("lo"), app.task("hi"));
        for c in [hi, lo] {
            run(&mut k, 0, c);
            assert_eq!(
                k.sys_rpc_call(0, server, c.index() as u32, INFINITE),
                Ok(Blocking::Blocked)
            );
            k.schedule(0);
        }
        run(&mut k, 0, server);
        assert_eq!(
            k.sys_rpc_recv(0, INFINITE),
            Ok(Blocking::Done((hi, hi.index() as u32)))
        );
        k.sys_task_terminate(0).unwrap();
        assert_eq!(k.task(hi).state(), TaskState::Ready);
        assert_eq!(result(k.task(hi).save().rets()), Err(ErrorCode::State));
        assert_eq!(k.task(lo).state(), TaskState::WaitSend);

        // The next activation still sees the request it never took.
        k.schedule(0);
        assert_eq!(k.current(0), Some(hi));
        k.sys_task_terminate(0).unwrap();
        run(&mut k, 0, server);
        assert_eq!(
            k.sys_rpc_recv(0, 0),
            Ok(Blocking::Done((lo, lo.index() as u32)))
        );
    }
}
