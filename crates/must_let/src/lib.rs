#[macro_export]
macro_rules! must_let {
    (let $pat:pat = $expr:expr) => {
        let $pat = $expr else {
            panic!(
                "must_let: value did not match pattern `{}`",
                stringify!($pat)
            );
        };
    };
}
