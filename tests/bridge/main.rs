mod attach;
mod common;
mod resolver;
mod stack;
