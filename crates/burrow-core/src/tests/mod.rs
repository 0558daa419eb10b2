mod client_tree;
mod filter;
mod forest;
mod lock;
