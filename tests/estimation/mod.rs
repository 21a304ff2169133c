mod config;
mod filter;
mod range;
mod smoother;
mod warm_start;
