pub(crate) mod local;
pub(crate) use local::LocalRunQueue;

pub(crate) mod remote;
pub(crate) use remote::RemoteRunQueue;
