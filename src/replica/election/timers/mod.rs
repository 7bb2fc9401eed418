mod deadline;
mod follower_timer;
mod leader_timer;
mod time;

#[cfg(test)]
mod test_utils;

pub(super) use follower_timer::FollowerTimerHandle;
pub(super) use leader_timer::LeaderTimerHandle;
