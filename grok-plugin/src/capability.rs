/// A kind of extension the registry can host.
///
/// `NAME` is the versioned interface name factories declare when they are
/// exported; `Instance` is what their constructor hands back, usually a boxed
/// trait object.
pub trait Capability: 'static {
    const NAME: &'static str;
    type Instance: Send + 'static;
}
